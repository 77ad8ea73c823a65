//! Persisted records for the chunked delivery protocol.
//!
//! Outbound and inbound chunks share the `message_id` correlation key but are
//! separate types stored in separate trees: the sender's chunks carry a retry
//! state machine, the receiver's chunks are immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const OUTBOUND_SCHEMA_VERSION: u8 = 1;
pub const INBOUND_SCHEMA_VERSION: u8 = 1;
pub const STATUS_SCHEMA_VERSION: u8 = 1;

/// Number of hex characters kept from a v4 UUID. Long ids eat into the
/// ~200 byte frame, 64 random bits are plenty for correlation.
const MESSAGE_ID_LEN: usize = 16;

/// Opaque per-message identifier shared by every chunk of one logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(MESSAGE_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Sender-side chunk lifecycle.
///
/// `Pending -> Sent -> Confirmed`, `Pending -> Failed`, and `Pending -> Confirmed`
/// when a peer confirmation overtakes the local "sent" write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Sent => "sent",
            ChunkStatus::Confirmed => "confirmed",
            ChunkStatus::Failed => "failed",
        }
    }
}

/// One piece of an outgoing message as tracked by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChunk {
    pub schema_version: u8,
    pub message_id: MessageId,
    pub peer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// False only for the single-fragment fast path, which goes out as raw text.
    pub framed: bool,
    pub content: String,
    pub status: ChunkStatus,
    /// Failed wire attempts so far.
    pub retry_count: u8,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl OutboundChunk {
    pub fn new(
        message_id: MessageId,
        peer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        framed: bool,
        content: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(chunk_index < total_chunks);
        Self {
            schema_version: OUTBOUND_SCHEMA_VERSION,
            message_id,
            peer_id: peer_id.to_string(),
            chunk_index,
            total_chunks,
            framed,
            content,
            status: ChunkStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at,
            sent_at: None,
            confirmed_at: None,
        }
    }

    /// Record a successful wire send. A chunk the peer already confirmed keeps
    /// its `Confirmed` status; only the timestamp is filled in.
    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        if self.status == ChunkStatus::Pending {
            self.status = ChunkStatus::Sent;
        }
        if self.sent_at.is_none() {
            self.sent_at = Some(at);
        }
    }

    /// Record a failed wire attempt; `exhausted` moves a pending chunk to `Failed`.
    pub fn record_failure(&mut self, retry_count: u8, error: &str, exhausted: bool) {
        self.retry_count = retry_count;
        self.last_error = Some(error.to_string());
        if exhausted && self.status == ChunkStatus::Pending {
            self.status = ChunkStatus::Failed;
        }
    }

    /// Returns false when the chunk was already confirmed.
    pub fn mark_confirmed(&mut self, at: DateTime<Utc>) -> bool {
        if self.status == ChunkStatus::Confirmed {
            return false;
        }
        self.status = ChunkStatus::Confirmed;
        self.confirmed_at = Some(at);
        true
    }
}

/// One piece of an incoming message as stored by the receiver. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundChunk {
    pub schema_version: u8,
    pub message_id: MessageId,
    pub from_peer: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl InboundChunk {
    pub fn new(
        message_id: MessageId,
        from_peer: &str,
        chunk_index: u32,
        total_chunks: u32,
        content: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: INBOUND_SCHEMA_VERSION,
            message_id,
            from_peer: from_peer.to_string(),
            chunk_index,
            total_chunks,
            content,
            received_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    InProgress,
    Completed,
    Abandoned,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::InProgress => "in_progress",
            DeliveryState::Completed => "completed",
            DeliveryState::Abandoned => "abandoned",
        }
    }
}

/// Sender-side aggregate for one framed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub schema_version: u8,
    pub message_id: MessageId,
    pub peer_id: String,
    pub total_chunks: u32,
    pub confirmed_chunks: u32,
    pub state: DeliveryState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Bytes dropped by the chunk-count cap; zero for complete messages.
    #[serde(default)]
    pub truncated_bytes: usize,
    #[serde(default)]
    pub abandon_reason: Option<String>,
}

impl DeliveryStatus {
    pub fn new(
        message_id: MessageId,
        peer_id: &str,
        total_chunks: u32,
        truncated_bytes: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: STATUS_SCHEMA_VERSION,
            message_id,
            peer_id: peer_id.to_string(),
            total_chunks,
            confirmed_chunks: 0,
            state: DeliveryState::InProgress,
            started_at,
            completed_at: None,
            last_activity_at: started_at,
            truncated_bytes,
            abandon_reason: None,
        }
    }

    /// Count one newly confirmed chunk. Returns true exactly once, on the
    /// confirmation that completes the message.
    pub fn record_confirmation(&mut self, at: DateTime<Utc>) -> bool {
        self.confirmed_chunks = (self.confirmed_chunks + 1).min(self.total_chunks);
        self.last_activity_at = at;
        if self.confirmed_chunks == self.total_chunks && self.state != DeliveryState::Completed {
            self.state = DeliveryState::Completed;
            self.completed_at = Some(at);
            return true;
        }
        false
    }

    /// Finalize an in-progress message after a terminal chunk failure.
    pub fn abandon(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.state != DeliveryState::InProgress {
            return false;
        }
        self.state = DeliveryState::Abandoned;
        self.abandon_reason = Some(reason.to_string());
        self.last_activity_at = at;
        true
    }
}

/// Result of applying one peer confirmation to the sender's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed {
        confirmed_chunks: u32,
        total_chunks: u32,
        /// True only for the confirmation that moved the message to `Completed`.
        completed: bool,
        /// Milliseconds between the wire send and this confirmation, when known.
        latency_ms: Option<i64>,
    },
    Duplicate,
    Unknown,
}

/// A fully received message handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedMessage {
    /// `None` for plain text from devices that never chunk.
    pub message_id: Option<MessageId>,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub chunk_count: u32,
}
