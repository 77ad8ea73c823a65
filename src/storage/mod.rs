//! # Storage Module - Delivery State Persistence
//!
//! Everything the delivery protocol needs to survive a restart lives behind
//! [`DeliveryStore`]: sender-side chunks and their per-message status
//! aggregate, receiver-side chunks, and the completion markers that keep
//! reassembly idempotent.
//!
//! ## Layout
//!
//! The sled implementation keeps one tree per record family:
//!
//! ```text
//! delivery_outbound    <message_id>:<index:010> -> OutboundChunk
//! delivery_status      <message_id>            -> DeliveryStatus
//! delivery_inbound     <message_id>:<index:010> -> InboundChunk
//! delivery_completed   <message_id>            -> unix seconds
//! ```
//!
//! Zero-padded indices make a prefix scan return a message's chunks in order.
//!
//! ## Atomicity
//!
//! Every read-modify-write runs inside a sled transaction, inbound inserts and
//! completion markers are compare-and-swap inserts, and confirming a chunk
//! updates the chunk and its status in one multi-tree transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::delivery::errors::DeliveryError;
use crate::delivery::types::{
    ConfirmationOutcome, DeliveryStatus, InboundChunk, MessageId, OutboundChunk,
};

mod sled_store;

pub use sled_store::{SledStore, SledStoreBuilder};

/// Counts of records removed by a retention purge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub outbound_chunks: usize,
    pub statuses: usize,
    pub inbound_chunks: usize,
    pub completion_markers: usize,
}

/// Persistence operations used by the delivery engine.
pub trait DeliveryStore: Send + Sync {
    /// Write a new message's chunks, plus its status row when framed, as one batch.
    fn insert_outbound(
        &self,
        status: Option<&DeliveryStatus>,
        chunks: &[OutboundChunk],
    ) -> Result<(), DeliveryError>;

    fn get_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
    ) -> Result<Option<OutboundChunk>, DeliveryError>;

    /// Chunks of one message in index order.
    fn outbound_chunks(&self, message_id: &MessageId) -> Result<Vec<OutboundChunk>, DeliveryError>;

    fn all_outbound(&self) -> Result<Vec<OutboundChunk>, DeliveryError>;

    /// Atomically apply `apply` to a stored chunk; `None` when it does not exist.
    fn update_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
        apply: &dyn Fn(&mut OutboundChunk),
    ) -> Result<Option<OutboundChunk>, DeliveryError>;

    /// Mark a chunk peer-confirmed and advance its message status in one step.
    fn confirm_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
        at: DateTime<Utc>,
    ) -> Result<ConfirmationOutcome, DeliveryError>;

    fn get_status(&self, message_id: &MessageId) -> Result<Option<DeliveryStatus>, DeliveryError>;

    fn update_status(
        &self,
        message_id: &MessageId,
        apply: &dyn Fn(&mut DeliveryStatus),
    ) -> Result<Option<DeliveryStatus>, DeliveryError>;

    fn list_statuses(&self) -> Result<Vec<DeliveryStatus>, DeliveryError>;

    /// Insert unless a chunk with the same `(message_id, chunk_index)` exists.
    /// Returns true when this call stored it.
    fn insert_inbound_if_absent(&self, chunk: &InboundChunk) -> Result<bool, DeliveryError>;

    fn inbound_chunks(&self, message_id: &MessageId) -> Result<Vec<InboundChunk>, DeliveryError>;

    /// Drop every stored chunk of an inbound message.
    fn discard_inbound(&self, message_id: &MessageId) -> Result<usize, DeliveryError>;

    /// Set the completion marker for an inbound message. Returns true only for
    /// the first caller.
    fn mark_completed_once(&self, message_id: &MessageId) -> Result<bool, DeliveryError>;

    fn is_completed(&self, message_id: &MessageId) -> Result<bool, DeliveryError>;

    /// Remove finished records older than `cutoff`. In-progress outbound
    /// messages are kept regardless of age.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, DeliveryError>;
}
