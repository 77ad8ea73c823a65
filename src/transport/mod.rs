//! # Transport Module
//!
//! The radio link as seen by the delivery core: a synchronous best-effort
//! `send` whose success only means the device accepted the bytes, and a stream
//! of [`InboundPacket`]s delivered over a tokio channel.
//!
//! ## Implementations
//!
//! - [`loopback::LoopbackTransport`] - in-memory pair for tests and `meshrelay selftest`
//! - `serial::SerialTransport` - Meshtastic text console over USB/UART (feature `serial`)
//!
//! ## Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! ```

use thiserror::Error;

pub mod loopback;
#[cfg(feature = "serial")]
pub mod serial;

pub use loopback::{loopback_pair, LoopbackTransport};

/// Failure of one wire send. All variants are treated as transient by the
/// outbound engine and count against the chunk's retry budget.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("radio busy: {0}")]
    Busy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// One payload as it came off the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Outbound half of the radio link.
pub trait Transport: Send + Sync {
    /// Node id of this end of the link.
    fn local_id(&self) -> &str;

    /// Hand `payload` to the radio for `peer_id`. `Ok` says nothing about
    /// whether the peer received it.
    fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), TransportError>;
}
