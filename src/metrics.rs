//! Process-wide delivery counters.
//! Read through [`snapshot`]; there is no exposition endpoint.
use std::sync::atomic::{AtomicU64, Ordering};

static CHUNKS_SENT: AtomicU64 = AtomicU64::new(0);
static CHUNKS_FAILED: AtomicU64 = AtomicU64::new(0);
static CHUNK_RETRIES: AtomicU64 = AtomicU64::new(0);
static OVERSIZED_FRAMES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_TRUNCATED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_ABANDONED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static CONFIRMATIONS_NEW: AtomicU64 = AtomicU64::new(0);
static CONFIRMATIONS_DUPLICATE: AtomicU64 = AtomicU64::new(0);
static CONFIRMATIONS_UNKNOWN: AtomicU64 = AtomicU64::new(0);
static CONFIRM_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static CONFIRM_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static INBOUND_CHUNKS: AtomicU64 = AtomicU64::new(0);
static INBOUND_DUPLICATES: AtomicU64 = AtomicU64::new(0);
static MALFORMED_FRAMES: AtomicU64 = AtomicU64::new(0);
static INCONSISTENT_MESSAGES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_REASSEMBLED: AtomicU64 = AtomicU64::new(0);

pub fn inc_chunks_sent() {
    CHUNKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunks_failed() {
    CHUNKS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chunk_retries() {
    CHUNK_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_oversized_frames() {
    OVERSIZED_FRAMES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_truncated() {
    MESSAGES_TRUNCATED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_abandoned() {
    MESSAGES_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_completed() {
    MESSAGES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_confirmations_new() {
    CONFIRMATIONS_NEW.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_confirmations_duplicate() {
    CONFIRMATIONS_DUPLICATE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_confirmations_unknown() {
    CONFIRMATIONS_UNKNOWN.fetch_add(1, Ordering::Relaxed);
}
/// Negative latencies (peer clock ahead of ours) are ignored.
pub fn observe_confirm_latency(ms: i64) {
    if let Ok(ms) = u64::try_from(ms) {
        CONFIRM_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
        CONFIRM_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn inc_inbound_chunks() {
    INBOUND_CHUNKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_duplicates() {
    INBOUND_DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_malformed_frames() {
    MALFORMED_FRAMES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inconsistent_messages() {
    INCONSISTENT_MESSAGES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_reassembled() {
    MESSAGES_REASSEMBLED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub chunks_sent: u64,
    pub chunks_failed: u64,
    pub chunk_retries: u64,
    pub oversized_frames: u64,
    pub messages_truncated: u64,
    pub messages_abandoned: u64,
    pub messages_completed: u64,
    pub confirmations_new: u64,
    pub confirmations_duplicate: u64,
    pub confirmations_unknown: u64,
    pub confirm_latency_avg_ms: Option<u64>,
    pub inbound_chunks: u64,
    pub inbound_duplicates: u64,
    pub malformed_frames: u64,
    pub inconsistent_messages: u64,
    pub messages_reassembled: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = CONFIRM_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = CONFIRM_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        chunks_sent: CHUNKS_SENT.load(Ordering::Relaxed),
        chunks_failed: CHUNKS_FAILED.load(Ordering::Relaxed),
        chunk_retries: CHUNK_RETRIES.load(Ordering::Relaxed),
        oversized_frames: OVERSIZED_FRAMES.load(Ordering::Relaxed),
        messages_truncated: MESSAGES_TRUNCATED.load(Ordering::Relaxed),
        messages_abandoned: MESSAGES_ABANDONED.load(Ordering::Relaxed),
        messages_completed: MESSAGES_COMPLETED.load(Ordering::Relaxed),
        confirmations_new: CONFIRMATIONS_NEW.load(Ordering::Relaxed),
        confirmations_duplicate: CONFIRMATIONS_DUPLICATE.load(Ordering::Relaxed),
        confirmations_unknown: CONFIRMATIONS_UNKNOWN.load(Ordering::Relaxed),
        confirm_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        inbound_chunks: INBOUND_CHUNKS.load(Ordering::Relaxed),
        inbound_duplicates: INBOUND_DUPLICATES.load(Ordering::Relaxed),
        malformed_frames: MALFORMED_FRAMES.load(Ordering::Relaxed),
        inconsistent_messages: INCONSISTENT_MESSAGES.load(Ordering::Relaxed),
        messages_reassembled: MESSAGES_REASSEMBLED.load(Ordering::Relaxed),
    }
}
