//! Read-only delivery reporting for diagnostics and the `status` command.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::errors::DeliveryError;
use super::types::{ChunkStatus, DeliveryState, DeliveryStatus, MessageId, OutboundChunk};
use crate::storage::DeliveryStore;

/// Outbound chunk counts by status.
///
/// `unconfirmable` is the part of `pending + sent` that no peer confirmation
/// can ever settle: unframed chunks, and chunks of messages that are no longer
/// in progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkTally {
    pub pending: usize,
    pub sent: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub unconfirmable: usize,
}

impl ChunkTally {
    /// Count `chunks`; `in_progress` holds the ids of framed messages still
    /// being delivered.
    pub fn from_chunks<'a>(
        chunks: impl IntoIterator<Item = &'a OutboundChunk>,
        in_progress: &HashSet<MessageId>,
    ) -> Self {
        let mut tally = Self::default();
        for chunk in chunks {
            match chunk.status {
                ChunkStatus::Pending => tally.pending += 1,
                ChunkStatus::Sent => tally.sent += 1,
                ChunkStatus::Confirmed => tally.confirmed += 1,
                ChunkStatus::Failed => tally.failed += 1,
            }
            let open = matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Sent);
            if open && !(chunk.framed && in_progress.contains(&chunk.message_id)) {
                tally.unconfirmable += 1;
            }
        }
        tally
    }

    /// Chunks still waiting on a send or a peer confirmation.
    pub fn outstanding(&self) -> usize {
        self.pending + self.sent - self.unconfirmable
    }

    pub fn total(&self) -> usize {
        self.pending + self.sent + self.confirmed + self.failed
    }
}

/// Everything known about one outbound message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub message_id: MessageId,
    /// `None` for unframed messages.
    pub status: Option<DeliveryStatus>,
    pub tally: ChunkTally,
    pub chunks: Vec<OutboundChunk>,
}

#[derive(Clone)]
pub struct StatusView {
    store: Arc<dyn DeliveryStore>,
}

impl StatusView {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    pub fn message_report(&self, message_id: &MessageId) -> Result<Option<MessageReport>, DeliveryError> {
        let status = self.store.get_status(message_id)?;
        let chunks = self.store.outbound_chunks(message_id)?;
        if status.is_none() && chunks.is_empty() {
            return Ok(None);
        }
        let in_progress: HashSet<MessageId> = status
            .iter()
            .filter(|s| s.state == DeliveryState::InProgress)
            .map(|s| s.message_id.clone())
            .collect();
        Ok(Some(MessageReport {
            message_id: message_id.clone(),
            tally: ChunkTally::from_chunks(&chunks, &in_progress),
            status,
            chunks,
        }))
    }

    /// System-wide chunk counts.
    pub fn chunk_tally(&self) -> Result<ChunkTally, DeliveryError> {
        let in_progress: HashSet<MessageId> = self
            .store
            .list_statuses()?
            .into_iter()
            .filter(|s| s.state == DeliveryState::InProgress)
            .map(|s| s.message_id)
            .collect();
        Ok(ChunkTally::from_chunks(&self.store.all_outbound()?, &in_progress))
    }

    /// Failed chunks with attempts left under `max_retries`, for an
    /// out-of-band re-drive.
    pub fn retry_candidates(&self, max_retries: u8) -> Result<Vec<OutboundChunk>, DeliveryError> {
        Ok(self
            .store
            .all_outbound()?
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Failed && c.retry_count < max_retries)
            .collect())
    }

    /// Message statuses, newest first.
    pub fn list_statuses(&self) -> Result<Vec<DeliveryStatus>, DeliveryError> {
        let mut statuses = self.store.list_statuses()?;
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(statuses)
    }
}
