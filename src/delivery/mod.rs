//! # Delivery Module - Reliable Chunked Messaging
//!
//! Moves text longer than one radio packet between two nodes. The sender
//! splits, frames, paces and retries; the receiver stores chunks, confirms
//! them and hands back the reassembled text exactly once.
//!
//! ## Components
//!
//! - [`chunker`] - pure splitting policy
//! - [`frame`] - JSON wire frames for chunks and confirmations
//! - [`outbound`] - sequential send engine with retry and pacing
//! - [`inbound`] - chunk persistence and reassembly
//! - [`confirm`] - peer confirmation bookkeeping
//! - [`status`] - read-only reporting
//!
//! [`DeliveryNode`] wires them around one store and one transport.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshrelay::delivery::{DeliveryNode, DeliveryTuning};
//! use meshrelay::storage::SledStore;
//! use meshrelay::transport::loopback_pair;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SledStore::open("./data/delivery")?);
//!     let ((alpha, _alpha_rx), (_bravo, _bravo_rx)) = loopback_pair("alpha", "bravo");
//!     let node = DeliveryNode::new(store, Arc::new(alpha), DeliveryTuning::default());
//!     let id = node.outbound().send_message("hello bravo", "bravo").await?;
//!     println!("sent {}", id);
//!     Ok(())
//! }
//! ```

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::DeliveryConfig;
use crate::storage::DeliveryStore;
use crate::transport::{InboundPacket, Transport};

pub mod chunker;
pub mod confirm;
pub mod errors;
pub mod frame;
pub mod inbound;
pub mod outbound;
pub mod status;
pub mod types;

pub use chunker::{Chunker, SplitOutcome};
pub use confirm::ConfirmationProcessor;
pub use errors::DeliveryError;
pub use frame::{ChunkFrame, ConfirmationFrame, Decoded, FrameCodec};
pub use inbound::Reassembler;
pub use outbound::{DeliveryTask, OutboundEngine};
pub use status::{ChunkTally, MessageReport, StatusView};
pub use types::{
    ChunkStatus, CompletedMessage, ConfirmationOutcome, DeliveryState, DeliveryStatus,
    InboundChunk, MessageId, OutboundChunk,
};

/// Smallest frame limit accepted from config; below this even the envelope
/// does not fit.
const MIN_FRAME_BYTES: usize = 64;
const MIN_CONTENT_BUDGET: usize = 16;
const MAX_CHUNK_CAP: usize = 64;
const MAX_RETRY_CAP: u8 = 10;

/// Delivery tuning parameters, typically sourced from Config
#[derive(Debug, Clone)]
pub struct DeliveryTuning {
    /// Texts longer than this (UTF-8 bytes) use the chunk protocol.
    pub split_threshold_bytes: usize,
    /// Content bytes per chunk, before the frame envelope.
    pub content_budget_bytes: usize,
    pub max_chunks: usize,
    /// Hard per-packet limit; frames above it are never sent.
    pub max_frame_bytes: usize,
    /// Wire attempts per chunk before it is marked failed.
    pub max_retries: u8,
    pub retry_delay: Duration,
    pub inter_chunk_delay: Duration,
    pub enable_confirmations: bool,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            split_threshold_bytes: 150,
            content_budget_bytes: 120,
            max_chunks: 16,
            max_frame_bytes: 200,
            max_retries: 3,
            retry_delay: Duration::from_secs(15),
            inter_chunk_delay: Duration::from_secs(2),
            enable_confirmations: true,
        }
    }
}

impl From<&DeliveryConfig> for DeliveryTuning {
    fn from(cfg: &DeliveryConfig) -> Self {
        let defaults = Self::default();
        let max_frame_bytes = cfg
            .max_frame_bytes
            .unwrap_or(defaults.max_frame_bytes)
            .max(MIN_FRAME_BYTES);
        Self {
            split_threshold_bytes: cfg
                .split_threshold_bytes
                .unwrap_or(defaults.split_threshold_bytes)
                .min(max_frame_bytes),
            content_budget_bytes: cfg
                .content_budget_bytes
                .unwrap_or(defaults.content_budget_bytes)
                .clamp(MIN_CONTENT_BUDGET, max_frame_bytes),
            max_chunks: cfg
                .max_chunks
                .unwrap_or(defaults.max_chunks)
                .clamp(1, MAX_CHUNK_CAP),
            max_frame_bytes,
            max_retries: cfg
                .max_retries
                .unwrap_or(defaults.max_retries)
                .clamp(1, MAX_RETRY_CAP),
            retry_delay: cfg
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            inter_chunk_delay: cfg
                .inter_chunk_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_chunk_delay),
            enable_confirmations: cfg
                .enable_confirmations
                .unwrap_or(defaults.enable_confirmations),
        }
    }
}

impl DeliveryTuning {
    pub fn chunker(&self) -> Chunker {
        Chunker::new(
            self.split_threshold_bytes,
            self.content_budget_bytes,
            self.max_chunks,
        )
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_bytes)
    }
}

/// One node's delivery stack: engine, reassembler and status view sharing a
/// store, a transport and a shutdown signal.
pub struct DeliveryNode {
    outbound: OutboundEngine,
    reassembler: Reassembler,
    view: StatusView,
    shutdown_tx: watch::Sender<bool>,
}

impl DeliveryNode {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        transport: Arc<dyn Transport>,
        tuning: DeliveryTuning,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let confirmations = ConfirmationProcessor::new(store.clone());
        let reassembler = Reassembler::new(
            store.clone(),
            transport.clone(),
            tuning.codec(),
            confirmations,
            tuning.enable_confirmations,
        );
        let view = StatusView::new(store.clone());
        let outbound = OutboundEngine::new(store, transport, tuning, shutdown_rx);
        Self {
            outbound,
            reassembler,
            view,
            shutdown_tx,
        }
    }

    pub fn outbound(&self) -> &OutboundEngine {
        &self.outbound
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn status_view(&self) -> &StatusView {
        &self.view
    }

    /// Stop pacing and retry waits and the inbound loop. In-flight messages
    /// stay `InProgress` and are picked up by `resume_incomplete` on restart.
    pub fn shutdown(&self) {
        info!("Delivery shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Feed received packets through the reassembler until the inbound
    /// channel closes, the completion receiver is dropped, or shutdown.
    pub async fn run_inbound(
        &self,
        mut inbound: mpsc::UnboundedReceiver<InboundPacket>,
        completed: mpsc::UnboundedSender<CompletedMessage>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        loop {
            tokio::select! {
                packet = inbound.recv() => {
                    let Some(packet) = packet else {
                        debug!("Inbound channel closed");
                        return;
                    };
                    match self.reassembler.on_frame_received(&packet.payload, &packet.from) {
                        Ok(Some(message)) => {
                            if completed.send(message).is_err() {
                                debug!("Completion receiver dropped; stopping inbound loop");
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!("Failed to process frame from {}: {}", packet.from, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow_and_update() {
                        info!("Inbound loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
