//! Test utilities & fixtures.
//! A scriptable transport plus helpers for throwaway stores and fast tuning.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshrelay::delivery::{DeliveryNode, DeliveryTuning};
use meshrelay::storage::{DeliveryStore, SledStore};
use meshrelay::transport::{Transport, TransportError};

/// Transport that records every accepted payload and fails on demand.
pub struct ScriptedTransport {
    local_id: String,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    /// Sends with a sequence number at or above this fail.
    fail_from: AtomicUsize,
    attempts: AtomicUsize,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            fail_next: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            fail_from: AtomicUsize::new(usize::MAX),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `n` attempts, then succeed.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, on: bool) {
        self.fail_always.store(on, Ordering::SeqCst);
    }

    /// Let the first `n` attempts through and fail every later one.
    pub fn fail_from(&self, n: usize) {
        self.fail_from.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().expect("sent log poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent log poisoned").len()
    }
}

impl Transport for ScriptedTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_always.load(Ordering::SeqCst) || attempt >= self.fail_from.load(Ordering::SeqCst) {
            return Err(TransportError::Busy("scripted failure".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(TransportError::Busy("scripted transient failure".into()));
        }
        self.sent
            .lock()
            .expect("sent log poisoned")
            .push((peer_id.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Millisecond delays so sequences finish quickly.
#[allow(dead_code)]
pub fn fast_tuning() -> DeliveryTuning {
    DeliveryTuning {
        retry_delay: Duration::from_millis(10),
        inter_chunk_delay: Duration::from_millis(5),
        ..DeliveryTuning::default()
    }
}

#[allow(dead_code)]
pub fn temp_store() -> (tempfile::TempDir, Arc<dyn DeliveryStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SledStore::open(dir.path().join("delivery")).expect("open store");
    (dir, Arc::new(store))
}

/// Node over a fresh store and a scripted transport named `alpha`.
#[allow(dead_code)]
pub fn scripted_node(
    tuning: DeliveryTuning,
) -> (
    tempfile::TempDir,
    DeliveryNode,
    Arc<dyn DeliveryStore>,
    Arc<ScriptedTransport>,
) {
    let (dir, store) = temp_store();
    let transport = ScriptedTransport::new("alpha");
    let node = DeliveryNode::new(store.clone(), transport.clone(), tuning);
    (dir, node, store, transport)
}
