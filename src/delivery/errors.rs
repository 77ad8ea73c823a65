use sled::transaction::TransactionError;
use thiserror::Error;

use crate::delivery::types::MessageId;

/// Errors raised by the delivery engine and its store.
///
/// Only store failures reach callers of `send_message`; transport failures are
/// turned into retry and failure transitions on the chunk, and the
/// frame/protocol variants are logged and dropped by the inbound path.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An encoded frame does not fit in one radio packet. Never retried.
    #[error("frame of {size} bytes exceeds the {limit}-byte wire limit")]
    OversizedFrame { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Chunks of one message disagree with each other.
    #[error("inconsistent chunks for message {message_id}: {detail}")]
    ProtocolInconsistency {
        message_id: MessageId,
        detail: String,
    },

    /// Confirmation for a chunk this node never sent.
    #[error("no outbound chunk {chunk_index} for message {message_id}")]
    UnknownConfirmation {
        message_id: MessageId,
        chunk_index: u32,
    },

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// Internal error (task join errors, unexpected conditions)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TransactionError<DeliveryError>> for DeliveryError {
    fn from(err: TransactionError<DeliveryError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => DeliveryError::Sled(e),
        }
    }
}

impl From<tokio::task::JoinError> for DeliveryError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeliveryError::Internal(format!("delivery task failed: {}", err))
    }
}
