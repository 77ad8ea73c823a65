//! # Meshrelay - Reliable Chunked Messaging for Meshtastic Networks
//!
//! A LoRa mesh packet carries about 200 bytes and the radio only promises
//! best-effort delivery of each one. Meshrelay moves longer text across such a
//! link: it splits messages on word and UTF-8 boundaries, sends the pieces one
//! at a time with pacing and bounded retries, tracks per-chunk confirmations
//! from the receiving node, and reassembles the text on the other side.
//!
//! ## Features
//!
//! - **Boundary-safe chunking**: fragments never split a codepoint and join back to the exact input.
//! - **Crash-safe state**: every chunk and message status lives in sled and is written before each pause.
//! - **Peer confirmations**: the receiver confirms each chunk; the sender marks a message completed once all are confirmed.
//! - **Observable failures**: truncation and abandoned sequences are recorded on the message status and counted in [`metrics`].
//! - **Pluggable radio**: anything implementing [`transport::Transport`]; a serial text-console driver and an in-memory loopback ship with the crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshrelay::delivery::{DeliveryNode, DeliveryTuning};
//! use meshrelay::storage::SledStore;
//! use meshrelay::transport::loopback_pair;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ((alpha, _alpha_rx), (bravo, bravo_rx)) = loopback_pair("alpha", "bravo");
//!     let sender = DeliveryNode::new(
//!         Arc::new(SledStore::open("./data/alpha")?),
//!         Arc::new(alpha),
//!         DeliveryTuning::default(),
//!     );
//!     let receiver = DeliveryNode::new(
//!         Arc::new(SledStore::open("./data/bravo")?),
//!         Arc::new(bravo),
//!         DeliveryTuning::default(),
//!     );
//!     let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
//!     tokio::spawn(async move { receiver.run_inbound(bravo_rx, done_tx).await });
//!
//!     sender.outbound().send_message(&"long text ".repeat(40), "bravo").await?;
//!     if let Some(message) = done_rx.recv().await {
//!         println!("{} bytes from {}", message.text.len(), message.sender);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`delivery`] - chunker, frame codec, outbound engine, reassembler, confirmations, status view
//! - [`storage`] - the `DeliveryStore` trait and its sled implementation
//! - [`transport`] - the radio link abstraction
//! - [`config`] - TOML configuration for the binary
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - single-line log sanitizing

pub mod config;
pub mod delivery;
pub mod logutil;
pub mod metrics;
pub mod storage;
pub mod transport;
