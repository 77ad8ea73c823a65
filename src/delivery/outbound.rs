//! Outbound delivery engine.
//!
//! One call to [`OutboundEngine::send_message`] drives one message from text
//! to wire: split, persist, then send chunks strictly in index order with a
//! fixed pause after each successful send. Each chunk gets `max_retries` wire
//! attempts separated by `retry_delay`.
//!
//! The first chunk that cannot be sent ends the sequence: that chunk is
//! `Failed`, later chunks stay `Pending`, and the message status becomes
//! `Abandoned` with the reason attached. Every state change is written before
//! the engine sleeps, so a shutdown during a pause leaves records that
//! [`OutboundEngine::resume_incomplete`] can pick up again.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::chunker::{Chunker, SplitOutcome};
use super::errors::DeliveryError;
use super::frame::{ChunkFrame, FrameCodec};
use super::types::{ChunkStatus, DeliveryState, DeliveryStatus, MessageId, OutboundChunk};
use super::DeliveryTuning;
use crate::logutil::preview;
use crate::metrics;
use crate::storage::DeliveryStore;
use crate::transport::Transport;

/// Handle to a sequence running on its own task.
pub type DeliveryTask = JoinHandle<Result<MessageId, DeliveryError>>;

/// How a chunk sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SequenceEnd {
    Finished,
    Aborted,
    Interrupted,
}

#[derive(Debug)]
enum AttemptResult {
    Sent,
    Failed(String),
    Interrupted,
}

#[derive(Clone)]
pub struct OutboundEngine {
    store: Arc<dyn DeliveryStore>,
    transport: Arc<dyn Transport>,
    chunker: Chunker,
    codec: FrameCodec,
    tuning: DeliveryTuning,
    shutdown: watch::Receiver<bool>,
}

impl OutboundEngine {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        transport: Arc<dyn Transport>,
        tuning: DeliveryTuning,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            transport,
            chunker: tuning.chunker(),
            codec: tuning.codec(),
            tuning,
            shutdown,
        }
    }

    pub fn tuning(&self) -> &DeliveryTuning {
        &self.tuning
    }

    /// Split, persist and transmit `text` to `peer_id`.
    ///
    /// Returns once the sequence finished, aborted or was interrupted by
    /// shutdown; it never waits for peer confirmations. Transport failures are
    /// recorded on the chunks and never returned; only store errors are.
    pub async fn send_message(&self, text: &str, peer_id: &str) -> Result<MessageId, DeliveryError> {
        let message_id = MessageId::generate();
        let now = Utc::now();

        let chunks = match self.chunker.plan(text) {
            SplitOutcome::Unframed(content) => {
                let chunk = OutboundChunk::new(message_id.clone(), peer_id, 0, 1, false, content, now);
                self.store.insert_outbound(None, std::slice::from_ref(&chunk))?;
                debug!(
                    "Sending message id={} to {} unframed: {}",
                    message_id,
                    peer_id,
                    preview(&chunk.content)
                );
                vec![chunk]
            }
            SplitOutcome::Framed {
                fragments,
                truncated_bytes,
            } => {
                let (fragments, refit_dropped) = self.fit_to_frames(&message_id, fragments);
                let truncated_bytes = truncated_bytes + refit_dropped;
                if truncated_bytes > 0 {
                    metrics::inc_messages_truncated();
                    warn!(
                        "Message id={} to {} exceeds {} chunks; dropping last {} bytes",
                        message_id, peer_id, self.tuning.max_chunks, truncated_bytes
                    );
                }
                let total = fragments.len() as u32;
                let chunks: Vec<OutboundChunk> = fragments
                    .into_iter()
                    .enumerate()
                    .map(|(index, content)| {
                        OutboundChunk::new(message_id.clone(), peer_id, index as u32, total, true, content, now)
                    })
                    .collect();
                let status = DeliveryStatus::new(message_id.clone(), peer_id, total, truncated_bytes, now);
                self.store.insert_outbound(Some(&status), &chunks)?;
                info!(
                    "Sending message id={} to {} in {} chunks ({} bytes)",
                    message_id,
                    peer_id,
                    total,
                    text.len()
                );
                chunks
            }
        };

        match self.deliver_chunks(&message_id, chunks).await? {
            SequenceEnd::Finished => debug!("All chunks of id={} handed to the radio", message_id),
            SequenceEnd::Aborted => {}
            SequenceEnd::Interrupted => info!(
                "Delivery of id={} paused by shutdown; it will resume on restart",
                message_id
            ),
        }
        Ok(message_id)
    }

    /// Run [`send_message`](Self::send_message) as its own task.
    pub fn spawn_send(&self, text: impl Into<String>, peer_id: impl Into<String>) -> DeliveryTask {
        let engine = self.clone();
        let text = text.into();
        let peer_id = peer_id.into();
        tokio::spawn(async move { engine.send_message(&text, &peer_id).await })
    }

    /// Start a task for every stored message that still has pending chunks
    /// and was not abandoned or completed.
    pub fn resume_incomplete(&self) -> Result<Vec<DeliveryTask>, DeliveryError> {
        let mut by_message: BTreeMap<MessageId, Vec<OutboundChunk>> = BTreeMap::new();
        for chunk in self.store.all_outbound()? {
            by_message.entry(chunk.message_id.clone()).or_default().push(chunk);
        }

        let mut tasks = Vec::new();
        for (message_id, chunks) in by_message {
            if !self.is_resumable(&message_id, &chunks)? {
                continue;
            }
            info!(
                "Resuming delivery of id={} to {} ({} of {} chunks pending)",
                message_id,
                chunks[0].peer_id,
                chunks.iter().filter(|c| c.status == ChunkStatus::Pending).count(),
                chunks.len()
            );
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                engine.deliver_chunks(&message_id, chunks).await?;
                Ok(message_id)
            }));
        }
        Ok(tasks)
    }

    /// Re-drive one message in place. Returns false when there was nothing
    /// to resume.
    pub async fn resume_message(&self, message_id: &MessageId) -> Result<bool, DeliveryError> {
        let chunks = self.store.outbound_chunks(message_id)?;
        if !self.is_resumable(message_id, &chunks)? {
            return Ok(false);
        }
        self.deliver_chunks(message_id, chunks).await?;
        Ok(true)
    }

    fn is_resumable(&self, message_id: &MessageId, chunks: &[OutboundChunk]) -> Result<bool, DeliveryError> {
        if chunks.is_empty()
            || chunks.iter().any(|c| c.status == ChunkStatus::Failed)
            || !chunks.iter().any(|c| c.status == ChunkStatus::Pending)
        {
            return Ok(false);
        }
        Ok(match self.store.get_status(message_id)? {
            Some(status) => status.state == DeliveryState::InProgress,
            None => true,
        })
    }

    /// Split any fragment whose encoded frame would exceed the packet limit,
    /// which happens when JSON escaping inflates the content. Returns the
    /// fitted fragments and the bytes dropped by re-applying the chunk cap.
    fn fit_to_frames(&self, message_id: &MessageId, fragments: Vec<String>) -> (Vec<String>, usize) {
        // Probe with the widest index the cap allows so real frames are never longer.
        let widest = self.tuning.max_chunks as u32;
        let fits = |content: &str| {
            let probe = ChunkFrame {
                message_id: message_id.clone(),
                chunk_index: widest,
                total_chunks: widest,
                content: content.to_string(),
            };
            self.codec.encode_chunk(&probe).is_ok()
        };

        let mut queue: VecDeque<String> = fragments.into();
        let mut fitted = Vec::with_capacity(queue.len());
        while let Some(fragment) = queue.pop_front() {
            if fits(&fragment) {
                fitted.push(fragment);
                continue;
            }
            let mut mid = fragment.len() / 2;
            while mid > 0 && !fragment.is_char_boundary(mid) {
                mid -= 1;
            }
            if mid == 0 {
                mid = fragment.chars().next().map(char::len_utf8).unwrap_or(0);
            }
            if mid == 0 || mid >= fragment.len() {
                // A single char that cannot fit; the send attempt reports it.
                fitted.push(fragment);
                continue;
            }
            let (head, tail) = fragment.split_at(mid);
            queue.push_front(tail.to_string());
            queue.push_front(head.to_string());
        }

        let dropped = if fitted.len() > self.tuning.max_chunks {
            fitted
                .drain(self.tuning.max_chunks..)
                .map(|f| f.len())
                .sum()
        } else {
            0
        };
        (fitted, dropped)
    }

    async fn deliver_chunks(
        &self,
        message_id: &MessageId,
        chunks: Vec<OutboundChunk>,
    ) -> Result<SequenceEnd, DeliveryError> {
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.status != ChunkStatus::Pending {
                continue;
            }
            match self.attempt_chunk(chunk).await? {
                AttemptResult::Sent => {
                    let more = chunks[position + 1..]
                        .iter()
                        .any(|c| c.status == ChunkStatus::Pending);
                    if more && !self.pause(self.tuning.inter_chunk_delay).await {
                        return Ok(SequenceEnd::Interrupted);
                    }
                }
                AttemptResult::Failed(reason) => {
                    self.abandon(message_id, &reason)?;
                    return Ok(SequenceEnd::Aborted);
                }
                AttemptResult::Interrupted => return Ok(SequenceEnd::Interrupted),
            }
        }
        Ok(SequenceEnd::Finished)
    }

    async fn attempt_chunk(&self, chunk: &OutboundChunk) -> Result<AttemptResult, DeliveryError> {
        let message_id = &chunk.message_id;
        let index = chunk.chunk_index;

        let encoded = if chunk.framed {
            self.codec.encode_chunk(&ChunkFrame {
                message_id: message_id.clone(),
                chunk_index: index,
                total_chunks: chunk.total_chunks,
                content: chunk.content.clone(),
            })
        } else {
            self.codec.encode_unframed(&chunk.content)
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e @ DeliveryError::OversizedFrame { .. }) => {
                let reason = e.to_string();
                metrics::inc_oversized_frames();
                metrics::inc_chunks_failed();
                error!("Chunk {} of id={} can never be sent: {}", index, message_id, reason);
                let retries = chunk.retry_count;
                self.store
                    .update_outbound(message_id, index, &|c| c.record_failure(retries, &reason, true))?;
                return Ok(AttemptResult::Failed(reason));
            }
            Err(e) => return Err(e),
        };

        let mut failures = chunk.retry_count;
        loop {
            match self.transport.send(&chunk.peer_id, &payload) {
                Ok(()) => {
                    let now = Utc::now();
                    self.store.update_outbound(message_id, index, &|c| c.mark_sent(now))?;
                    metrics::inc_chunks_sent();
                    debug!(
                        "Sent chunk {}/{} of id={} to {} ({} bytes)",
                        index + 1,
                        chunk.total_chunks,
                        message_id,
                        chunk.peer_id,
                        payload.len()
                    );
                    return Ok(AttemptResult::Sent);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let exhausted = failures >= self.tuning.max_retries;
                    let reason = e.to_string();
                    self.store.update_outbound(message_id, index, &|c| {
                        c.record_failure(failures, &reason, exhausted)
                    })?;
                    if exhausted {
                        metrics::inc_chunks_failed();
                        warn!(
                            "Chunk {} of id={} failed after {} attempts: {}",
                            index, message_id, failures, reason
                        );
                        return Ok(AttemptResult::Failed(format!(
                            "chunk {} failed after {} attempts: {}",
                            index, failures, reason
                        )));
                    }
                    metrics::inc_chunk_retries();
                    warn!(
                        "Send of chunk {} of id={} failed (attempt {}/{}): {}; retrying in {:?}",
                        index, message_id, failures, self.tuning.max_retries, reason, self.tuning.retry_delay
                    );
                    if !self.pause(self.tuning.retry_delay).await {
                        return Ok(AttemptResult::Interrupted);
                    }
                }
            }
        }
    }

    fn abandon(&self, message_id: &MessageId, reason: &str) -> Result<(), DeliveryError> {
        let now = Utc::now();
        let updated = self.store.update_status(message_id, &|s| {
            s.abandon(reason, now);
        })?;
        match updated {
            Some(status) if status.state == DeliveryState::Abandoned => {
                metrics::inc_messages_abandoned();
                warn!(
                    "Abandoned id={} to {} with {}/{} chunks confirmed: {}",
                    message_id, status.peer_id, status.confirmed_chunks, status.total_chunks, reason
                );
            }
            Some(status) => debug!(
                "Delivery of id={} already {}; not abandoning",
                message_id,
                status.state.as_str()
            ),
            None => warn!("Unframed message id={} not delivered: {}", message_id, reason),
        }
        Ok(())
    }

    /// Sleep for `duration` unless shutdown is signalled first. Returns false
    /// when the sequence should stop.
    async fn pause(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                changed = shutdown.changed() => match changed {
                    Ok(()) => {
                        if *shutdown.borrow_and_update() {
                            return false;
                        }
                    }
                    Err(_) => {
                        // Signal owner gone; nobody can ask us to stop any more.
                        sleep_until(deadline).await;
                        return true;
                    }
                },
            }
        }
    }
}
