//! Wire encoding for chunk and confirmation frames.
//!
//! Both frame types are single compact JSON objects with one-letter keys so the
//! envelope stays small next to the content:
//!
//! ```text
//! chunk:        {"id":"3f9a0c1e22b7d410","i":0,"n":3,"c":"first part of the text "}
//! confirmation: {"t":"ack","id":"3f9a0c1e22b7d410","i":0,"ts":1760600000}
//! ```
//!
//! Anything that is neither is handed back as plain text, so peers that never
//! chunk keep working.

use serde::{Deserialize, Serialize};

use crate::delivery::errors::DeliveryError;
use crate::delivery::types::MessageId;

const CONFIRMATION_TAG: &str = "ack";
/// Longest message id accepted from a peer.
const MAX_MESSAGE_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkFrame {
    #[serde(rename = "id")]
    pub message_id: MessageId,
    #[serde(rename = "i")]
    pub chunk_index: u32,
    #[serde(rename = "n")]
    pub total_chunks: u32,
    #[serde(rename = "c")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationFrame {
    pub message_id: MessageId,
    pub chunk_index: u32,
    /// Unix seconds at the receiver when the chunk was accepted.
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfirmationWire {
    t: String,
    id: MessageId,
    i: u32,
    ts: i64,
}

/// Classification of one received payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Chunk(ChunkFrame),
    Confirmation(ConfirmationFrame),
    /// Looked like a protocol frame but broke its invariants.
    Malformed(String),
    /// Not a protocol frame at all.
    Plain(String),
}

/// Encoder/decoder bound to the hard per-packet limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn encode_chunk(&self, frame: &ChunkFrame) -> Result<Vec<u8>, DeliveryError> {
        let bytes = serde_json::to_vec(frame)
            .map_err(|e| DeliveryError::Internal(format!("chunk frame encoding: {}", e)))?;
        self.check_size(bytes)
    }

    pub fn encode_confirmation(&self, frame: &ConfirmationFrame) -> Result<Vec<u8>, DeliveryError> {
        let wire = ConfirmationWire {
            t: CONFIRMATION_TAG.to_string(),
            id: frame.message_id.clone(),
            i: frame.chunk_index,
            ts: frame.timestamp,
        };
        let bytes = serde_json::to_vec(&wire)
            .map_err(|e| DeliveryError::Internal(format!("confirmation encoding: {}", e)))?;
        self.check_size(bytes)
    }

    /// Raw text sent without an envelope is still bound by the packet limit.
    pub fn encode_unframed(&self, text: &str) -> Result<Vec<u8>, DeliveryError> {
        self.check_size(text.as_bytes().to_vec())
    }

    fn check_size(&self, bytes: Vec<u8>) -> Result<Vec<u8>, DeliveryError> {
        if bytes.len() > self.max_frame_bytes {
            return Err(DeliveryError::OversizedFrame {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(bytes)
    }

    /// Classify a received payload. Never fails: anything unrecognized comes
    /// back as `Plain`.
    pub fn decode(&self, payload: &[u8]) -> Decoded {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => return Decoded::Plain(String::from_utf8_lossy(payload).into_owned()),
        };
        if !text.trim_start().starts_with('{') {
            return Decoded::Plain(text.to_string());
        }

        if let Ok(frame) = serde_json::from_str::<ChunkFrame>(text) {
            return match validate_chunk(&frame) {
                Ok(()) => Decoded::Chunk(frame),
                Err(e) => Decoded::Malformed(e.to_string()),
            };
        }

        if let Ok(wire) = serde_json::from_str::<ConfirmationWire>(text) {
            if wire.t != CONFIRMATION_TAG {
                return Decoded::Plain(text.to_string());
            }
            if !is_valid_message_id(&wire.id) {
                return Decoded::Malformed(format!("confirmation with bad message id {:?}", wire.id.as_str()));
            }
            return Decoded::Confirmation(ConfirmationFrame {
                message_id: wire.id,
                chunk_index: wire.i,
                timestamp: wire.ts,
            });
        }

        Decoded::Plain(text.to_string())
    }
}

/// Ids double as storage key prefixes, so only a conservative charset is accepted.
fn is_valid_message_id(id: &MessageId) -> bool {
    let id = id.as_str();
    !id.is_empty()
        && id.len() <= MAX_MESSAGE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate_chunk(frame: &ChunkFrame) -> Result<(), DeliveryError> {
    if !is_valid_message_id(&frame.message_id) {
        return Err(DeliveryError::MalformedFrame(format!(
            "chunk with bad message id {:?}",
            frame.message_id.as_str()
        )));
    }
    if frame.total_chunks == 0 {
        return Err(DeliveryError::MalformedFrame(format!(
            "message {} declares zero chunks",
            frame.message_id
        )));
    }
    if frame.chunk_index >= frame.total_chunks {
        return Err(DeliveryError::MalformedFrame(format!(
            "message {} chunk index {} out of range for {} chunks",
            frame.message_id, frame.chunk_index, frame.total_chunks
        )));
    }
    Ok(())
}
