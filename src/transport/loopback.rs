//! In-memory transport pair. Each end delivers straight into the other end's
//! inbound channel, so two delivery nodes can talk inside one process.

use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{InboundPacket, Transport, TransportError};

pub struct LoopbackTransport {
    local_id: String,
    peer_id: String,
    peer_tx: mpsc::UnboundedSender<InboundPacket>,
    sent: AtomicU64,
}

impl LoopbackTransport {
    /// Payloads accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Build two connected ends. Each tuple holds the transport for that node and
/// the receiver its inbound loop should consume.
pub fn loopback_pair(
    a: &str,
    b: &str,
) -> (
    (LoopbackTransport, mpsc::UnboundedReceiver<InboundPacket>),
    (LoopbackTransport, mpsc::UnboundedReceiver<InboundPacket>),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let end_a = LoopbackTransport {
        local_id: a.to_string(),
        peer_id: b.to_string(),
        peer_tx: b_tx,
        sent: AtomicU64::new(0),
    };
    let end_b = LoopbackTransport {
        local_id: b.to_string(),
        peer_id: a.to_string(),
        peer_tx: a_tx,
        sent: AtomicU64::new(0),
    };
    ((end_a, a_rx), (end_b, b_rx))
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        if peer_id != self.peer_id {
            return Err(TransportError::Unreachable(peer_id.to_string()));
        }
        self.peer_tx
            .send(InboundPacket {
                from: self.local_id.clone(),
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::Closed)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!("loopback {} -> {}: {} bytes", self.local_id, peer_id, payload.len());
        Ok(())
    }
}
