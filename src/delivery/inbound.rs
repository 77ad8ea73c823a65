//! Inbound reassembly.
//!
//! Every received payload is classified by the codec. Confirmations go to the
//! [`ConfirmationProcessor`], chunks are stored insert-if-absent and
//! confirmed back to the sender, and plain text is returned as-is. A message
//! is handed out once all its chunks are present; the completion marker in
//! the store makes that happen exactly once even when the last two chunks
//! race.

use chrono::Utc;
use log::{debug, info, trace, warn};
use std::sync::Arc;

use super::confirm::ConfirmationProcessor;
use super::errors::DeliveryError;
use super::frame::{ChunkFrame, ConfirmationFrame, Decoded, FrameCodec};
use super::types::{CompletedMessage, InboundChunk, MessageId};
use crate::logutil::preview;
use crate::metrics;
use crate::storage::DeliveryStore;
use crate::transport::Transport;

#[derive(Clone)]
pub struct Reassembler {
    store: Arc<dyn DeliveryStore>,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    confirmations: ConfirmationProcessor,
    enable_confirmations: bool,
}

impl Reassembler {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        transport: Arc<dyn Transport>,
        codec: FrameCodec,
        confirmations: ConfirmationProcessor,
        enable_confirmations: bool,
    ) -> Self {
        Self {
            store,
            transport,
            codec,
            confirmations,
            enable_confirmations,
        }
    }

    /// Process one received payload. Returns the completed message when this
    /// payload finished one. Only store failures are errors; bad frames are
    /// logged and dropped.
    pub fn on_frame_received(
        &self,
        bytes: &[u8],
        from_peer: &str,
    ) -> Result<Option<CompletedMessage>, DeliveryError> {
        match self.codec.decode(bytes) {
            Decoded::Confirmation(frame) => {
                trace!(
                    "Confirmation from {} for chunk {} of id={} (peer ts {})",
                    from_peer,
                    frame.chunk_index,
                    frame.message_id,
                    frame.timestamp
                );
                self.confirmations
                    .on_confirmation(&frame.message_id, frame.chunk_index)?;
                Ok(None)
            }
            Decoded::Chunk(frame) => self.on_chunk(frame, from_peer),
            Decoded::Malformed(reason) => {
                metrics::inc_malformed_frames();
                warn!("Dropping malformed frame from {}: {}", from_peer, reason);
                Ok(None)
            }
            Decoded::Plain(text) => {
                debug!("Plain message from {}: {}", from_peer, preview(&text));
                Ok(Some(CompletedMessage {
                    message_id: None,
                    sender: from_peer.to_string(),
                    receiver: self.transport.local_id().to_string(),
                    text,
                    chunk_count: 1,
                }))
            }
        }
    }

    fn on_chunk(
        &self,
        frame: ChunkFrame,
        from_peer: &str,
    ) -> Result<Option<CompletedMessage>, DeliveryError> {
        let message_id = frame.message_id.clone();
        let index = frame.chunk_index;

        // Late chunks of a finished or discarded message are only re-confirmed.
        let stored = if self.store.is_completed(&message_id)? {
            false
        } else {
            let chunk = InboundChunk::new(
                frame.message_id,
                from_peer,
                index,
                frame.total_chunks,
                frame.content,
                Utc::now(),
            );
            self.store.insert_inbound_if_absent(&chunk)?
        };
        if stored {
            metrics::inc_inbound_chunks();
            debug!(
                "Stored chunk {}/{} of id={} from {}",
                index + 1,
                frame.total_chunks,
                message_id,
                from_peer
            );
        } else {
            metrics::inc_inbound_duplicates();
            debug!("Duplicate chunk {} of id={} from {}", index, message_id, from_peer);
        }

        if self.enable_confirmations {
            self.send_confirmation(&message_id, index, from_peer);
        }

        if !stored {
            return Ok(None);
        }
        self.try_complete(&message_id)
    }

    fn try_complete(&self, message_id: &MessageId) -> Result<Option<CompletedMessage>, DeliveryError> {
        let chunks = self.store.inbound_chunks(message_id)?;
        let Some(first) = chunks.first() else {
            return Ok(None);
        };
        let declared = first.total_chunks;

        if let Some(odd) = chunks.iter().find(|c| c.total_chunks != declared) {
            let err = DeliveryError::ProtocolInconsistency {
                message_id: message_id.clone(),
                detail: format!(
                    "chunk {} declares {} chunks but chunk {} declares {}",
                    first.chunk_index, declared, odd.chunk_index, odd.total_chunks
                ),
            };
            metrics::inc_inconsistent_messages();
            warn!("{}; discarding message", err);
            // Tombstone first so stragglers are not stored again.
            self.store.mark_completed_once(message_id)?;
            self.store.discard_inbound(message_id)?;
            return Ok(None);
        }

        if chunks.len() as u32 != declared {
            // A discard can land between the completion check and our insert.
            if self.store.is_completed(message_id)? {
                self.drop_orphans(message_id)?;
            }
            return Ok(None);
        }
        if !self.store.mark_completed_once(message_id)? {
            return Ok(None);
        }

        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        metrics::inc_messages_reassembled();
        info!(
            "Reassembled id={} from {} ({} chunks, {} bytes)",
            message_id,
            first.from_peer,
            declared,
            text.len()
        );
        Ok(Some(CompletedMessage {
            message_id: Some(message_id.clone()),
            sender: first.from_peer.clone(),
            receiver: self.transport.local_id().to_string(),
            text,
            chunk_count: declared,
        }))
    }

    /// Remove chunks stored behind a discard marker. A message that really
    /// completed still holds its full consistent set and is left alone.
    fn drop_orphans(&self, message_id: &MessageId) -> Result<(), DeliveryError> {
        let chunks = self.store.inbound_chunks(message_id)?;
        let whole = chunks.first().map_or(true, |first| {
            chunks.len() as u32 == first.total_chunks
                && chunks.iter().all(|c| c.total_chunks == first.total_chunks)
        });
        if !whole {
            let removed = self.store.discard_inbound(message_id)?;
            debug!("Removed {} late chunk(s) of discarded id={}", removed, message_id);
        }
        Ok(())
    }

    /// Best effort; a lost confirmation is repaired when the chunk is re-sent.
    fn send_confirmation(&self, message_id: &MessageId, chunk_index: u32, peer_id: &str) {
        let frame = ConfirmationFrame {
            message_id: message_id.clone(),
            chunk_index,
            timestamp: Utc::now().timestamp(),
        };
        let payload = match self.codec.encode_confirmation(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode confirmation for id={}: {}", message_id, e);
                return;
            }
        };
        if let Err(e) = self.transport.send(peer_id, &payload) {
            warn!(
                "Confirmation for chunk {} of id={} to {} not sent: {}",
                chunk_index, message_id, peer_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::types::{ConfirmationOutcome, DeliveryStatus, OutboundChunk};
    use crate::storage::{PurgeReport, SledStore, SledStoreBuilder};
    use crate::transport::loopback_pair;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Runs a tombstone and discard for the message right before the next
    /// inbound insert, as a concurrent inconsistency would.
    struct DiscardBeforeInsert {
        inner: SledStore,
        armed: AtomicBool,
    }

    impl DeliveryStore for DiscardBeforeInsert {
        fn insert_outbound(&self, status: Option<&DeliveryStatus>, chunks: &[OutboundChunk]) -> Result<(), DeliveryError> {
            self.inner.insert_outbound(status, chunks)
        }
        fn get_outbound(&self, id: &MessageId, index: u32) -> Result<Option<OutboundChunk>, DeliveryError> {
            self.inner.get_outbound(id, index)
        }
        fn outbound_chunks(&self, id: &MessageId) -> Result<Vec<OutboundChunk>, DeliveryError> {
            self.inner.outbound_chunks(id)
        }
        fn all_outbound(&self) -> Result<Vec<OutboundChunk>, DeliveryError> {
            self.inner.all_outbound()
        }
        fn update_outbound(
            &self,
            id: &MessageId,
            index: u32,
            apply: &dyn Fn(&mut OutboundChunk),
        ) -> Result<Option<OutboundChunk>, DeliveryError> {
            self.inner.update_outbound(id, index, apply)
        }
        fn confirm_outbound(&self, id: &MessageId, index: u32, at: DateTime<Utc>) -> Result<ConfirmationOutcome, DeliveryError> {
            self.inner.confirm_outbound(id, index, at)
        }
        fn get_status(&self, id: &MessageId) -> Result<Option<DeliveryStatus>, DeliveryError> {
            self.inner.get_status(id)
        }
        fn update_status(
            &self,
            id: &MessageId,
            apply: &dyn Fn(&mut DeliveryStatus),
        ) -> Result<Option<DeliveryStatus>, DeliveryError> {
            self.inner.update_status(id, apply)
        }
        fn list_statuses(&self) -> Result<Vec<DeliveryStatus>, DeliveryError> {
            self.inner.list_statuses()
        }
        fn insert_inbound_if_absent(&self, chunk: &InboundChunk) -> Result<bool, DeliveryError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.mark_completed_once(&chunk.message_id)?;
                self.inner.discard_inbound(&chunk.message_id)?;
            }
            self.inner.insert_inbound_if_absent(chunk)
        }
        fn inbound_chunks(&self, id: &MessageId) -> Result<Vec<InboundChunk>, DeliveryError> {
            self.inner.inbound_chunks(id)
        }
        fn discard_inbound(&self, id: &MessageId) -> Result<usize, DeliveryError> {
            self.inner.discard_inbound(id)
        }
        fn mark_completed_once(&self, id: &MessageId) -> Result<bool, DeliveryError> {
            self.inner.mark_completed_once(id)
        }
        fn is_completed(&self, id: &MessageId) -> Result<bool, DeliveryError> {
            self.inner.is_completed(id)
        }
        fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, DeliveryError> {
            self.inner.purge_older_than(cutoff)
        }
    }

    fn reassembler(confirm: bool) -> Reassembler {
        let store: Arc<dyn DeliveryStore> = Arc::new(SledStoreBuilder::temporary().open().expect("store"));
        let ((bravo, _rx), _alpha) = loopback_pair("bravo", "alpha");
        Reassembler::new(
            store.clone(),
            Arc::new(bravo),
            FrameCodec::new(200),
            ConfirmationProcessor::new(store),
            confirm,
        )
    }

    #[test]
    fn plain_text_is_complete_immediately() {
        let r = reassembler(false);
        let done = r.on_frame_received(b"hello there", "alpha").unwrap().expect("message");
        assert_eq!(done.text, "hello there");
        assert_eq!(done.sender, "alpha");
        assert_eq!(done.receiver, "bravo");
        assert!(done.message_id.is_none());
    }

    #[test]
    fn out_of_order_chunks_reassemble_by_index() {
        let r = reassembler(false);
        assert!(r
            .on_frame_received(br#"{"id":"m1","i":1,"n":2,"c":"world"}"#, "alpha")
            .unwrap()
            .is_none());
        let done = r
            .on_frame_received(br#"{"id":"m1","i":0,"n":2,"c":"hello "}"#, "alpha")
            .unwrap()
            .expect("complete");
        assert_eq!(done.text, "hello world");
        assert_eq!(done.chunk_count, 2);
    }

    #[test]
    fn chunk_landing_after_a_discard_is_removed() {
        let store = Arc::new(DiscardBeforeInsert {
            inner: SledStoreBuilder::temporary().open().expect("store"),
            armed: AtomicBool::new(false),
        });
        let ((bravo, _rx), _alpha) = loopback_pair("bravo", "alpha");
        let r = Reassembler::new(
            store.clone(),
            Arc::new(bravo),
            FrameCodec::new(200),
            ConfirmationProcessor::new(store.clone()),
            false,
        );
        let id = MessageId::from("m2");
        assert!(r
            .on_frame_received(br#"{"id":"m2","i":0,"n":3,"c":"a"}"#, "alpha")
            .unwrap()
            .is_none());

        store.armed.store(true, Ordering::SeqCst);
        assert!(r
            .on_frame_received(br#"{"id":"m2","i":1,"n":3,"c":"b"}"#, "alpha")
            .unwrap()
            .is_none());
        assert!(store.is_completed(&id).unwrap());
        assert!(store.inbound_chunks(&id).unwrap().is_empty());
    }

    #[test]
    fn completed_message_keeps_its_chunks() {
        let r = reassembler(false);
        r.on_frame_received(br#"{"id":"m3","i":0,"n":2,"c":"x"}"#, "alpha").unwrap();
        r.on_frame_received(br#"{"id":"m3","i":1,"n":2,"c":"y"}"#, "alpha")
            .unwrap()
            .expect("complete");
        assert_eq!(r.store.inbound_chunks(&MessageId::from("m3")).unwrap().len(), 2);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let r = reassembler(false);
        assert!(r
            .on_frame_received(br#"{"id":"m1","i":0,"n":0,"c":"x"}"#, "alpha")
            .unwrap()
            .is_none());
    }
}
