use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Transactional;

use super::{DeliveryStore, PurgeReport};
use crate::delivery::errors::DeliveryError;
use crate::delivery::types::{
    ChunkStatus, ConfirmationOutcome, DeliveryState, DeliveryStatus, InboundChunk, MessageId,
    OutboundChunk, INBOUND_SCHEMA_VERSION, OUTBOUND_SCHEMA_VERSION, STATUS_SCHEMA_VERSION,
};

const TREE_OUTBOUND: &str = "delivery_outbound";
const TREE_STATUS: &str = "delivery_status";
const TREE_INBOUND: &str = "delivery_inbound";
const TREE_COMPLETED: &str = "delivery_completed";

/// Records carry a schema byte that is checked on every read.
trait Record: Serialize + DeserializeOwned {
    const ENTITY: &'static str;
    const VERSION: u8;
    fn schema_version(&self) -> u8;
}

impl Record for OutboundChunk {
    const ENTITY: &'static str = "outbound chunk";
    const VERSION: u8 = OUTBOUND_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

impl Record for InboundChunk {
    const ENTITY: &'static str = "inbound chunk";
    const VERSION: u8 = INBOUND_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

impl Record for DeliveryStatus {
    const ENTITY: &'static str = "delivery status";
    const VERSION: u8 = STATUS_SCHEMA_VERSION;
    fn schema_version(&self) -> u8 {
        self.schema_version
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DeliveryError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: Record>(bytes: &[u8]) -> Result<T, DeliveryError> {
    let record: T = bincode::deserialize(bytes)?;
    if record.schema_version() != T::VERSION {
        return Err(DeliveryError::SchemaMismatch {
            entity: T::ENTITY,
            expected: T::VERSION,
            found: record.schema_version(),
        });
    }
    Ok(record)
}

fn abort<T>(result: Result<T, DeliveryError>) -> ConflictableTransactionResult<T, DeliveryError> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn chunk_key(message_id: &MessageId, chunk_index: u32) -> Vec<u8> {
    format!("{}:{:010}", message_id, chunk_index).into_bytes()
}

fn message_prefix(message_id: &MessageId) -> Vec<u8> {
    format!("{}:", message_id).into_bytes()
}

fn status_key(message_id: &MessageId) -> Vec<u8> {
    message_id.as_str().as_bytes().to_vec()
}

/// Read-modify-write of one record inside a single-tree transaction.
fn update_in<T: Record>(
    tree: &sled::Tree,
    key: &[u8],
    apply: &dyn Fn(&mut T),
) -> Result<Option<T>, DeliveryError> {
    let updated = tree.transaction(|tx| -> ConflictableTransactionResult<Option<T>, DeliveryError> {
        let Some(raw) = tx.get(key)? else {
            return Ok(None);
        };
        let mut record: T = abort(decode(&raw))?;
        apply(&mut record);
        tx.insert(key, abort(encode(&record))?)?;
        Ok(Some(record))
    })?;
    Ok(updated)
}

fn scan<T: Record>(tree: &sled::Tree, prefix: &[u8]) -> Result<Vec<T>, DeliveryError> {
    tree.scan_prefix(prefix)
        .map(|entry| {
            let (_key, value) = entry?;
            decode(&value)
        })
        .collect()
}

/// Helper builder so tests can easily create throwaway stores.
pub struct SledStoreBuilder {
    path: Option<PathBuf>,
}

impl SledStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Self {
        Self { path: None }
    }

    pub fn open(self) -> Result<SledStore, DeliveryError> {
        let db = match self.path {
            Some(path) => {
                std::fs::create_dir_all(&path)?;
                sled::open(path)?
            }
            None => sled::Config::new().temporary(true).open()?,
        };
        SledStore::from_db(db)
    }
}

/// Sled-backed delivery state.
pub struct SledStore {
    db: sled::Db,
    outbound: sled::Tree,
    statuses: sled::Tree,
    inbound: sled::Tree,
    completed: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeliveryError> {
        SledStoreBuilder::new(path.as_ref()).open()
    }

    fn from_db(db: sled::Db) -> Result<Self, DeliveryError> {
        let outbound = db.open_tree(TREE_OUTBOUND)?;
        let statuses = db.open_tree(TREE_STATUS)?;
        let inbound = db.open_tree(TREE_INBOUND)?;
        let completed = db.open_tree(TREE_COMPLETED)?;
        Ok(Self {
            db,
            outbound,
            statuses,
            inbound,
            completed,
        })
    }

    fn flush(&self) -> Result<(), DeliveryError> {
        self.db.flush()?;
        Ok(())
    }

    fn remove_prefix(tree: &sled::Tree, prefix: &[u8]) -> Result<usize, DeliveryError> {
        let keys: Vec<sled::IVec> = tree
            .scan_prefix(prefix)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in &keys {
            tree.remove(key)?;
        }
        Ok(keys.len())
    }
}

impl DeliveryStore for SledStore {
    fn insert_outbound(
        &self,
        status: Option<&DeliveryStatus>,
        chunks: &[OutboundChunk],
    ) -> Result<(), DeliveryError> {
        let encoded_chunks = chunks
            .iter()
            .map(|c| Ok((chunk_key(&c.message_id, c.chunk_index), encode(c)?)))
            .collect::<Result<Vec<_>, DeliveryError>>()?;
        let encoded_status = status
            .map(|s| encode(s).map(|bytes| (status_key(&s.message_id), bytes)))
            .transpose()?;

        (&self.outbound, &self.statuses).transaction(
            |(outbound, statuses)| -> ConflictableTransactionResult<(), DeliveryError> {
                for (key, value) in &encoded_chunks {
                    outbound.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some((key, value)) = &encoded_status {
                    statuses.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            },
        )?;
        self.flush()
    }

    fn get_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
    ) -> Result<Option<OutboundChunk>, DeliveryError> {
        match self.outbound.get(chunk_key(message_id, chunk_index))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn outbound_chunks(&self, message_id: &MessageId) -> Result<Vec<OutboundChunk>, DeliveryError> {
        scan(&self.outbound, &message_prefix(message_id))
    }

    fn all_outbound(&self) -> Result<Vec<OutboundChunk>, DeliveryError> {
        scan(&self.outbound, b"")
    }

    fn update_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
        apply: &dyn Fn(&mut OutboundChunk),
    ) -> Result<Option<OutboundChunk>, DeliveryError> {
        let updated = update_in(&self.outbound, &chunk_key(message_id, chunk_index), apply)?;
        self.flush()?;
        Ok(updated)
    }

    fn confirm_outbound(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
        at: DateTime<Utc>,
    ) -> Result<ConfirmationOutcome, DeliveryError> {
        let chunk_key = chunk_key(message_id, chunk_index);
        let status_key = status_key(message_id);
        let outcome = (&self.outbound, &self.statuses).transaction(
            |(outbound, statuses)| -> ConflictableTransactionResult<ConfirmationOutcome, DeliveryError> {
                let Some(raw) = outbound.get(chunk_key.as_slice())? else {
                    return Ok(ConfirmationOutcome::Unknown);
                };
                let mut chunk: OutboundChunk = abort(decode(&raw))?;
                if !chunk.mark_confirmed(at) {
                    return Ok(ConfirmationOutcome::Duplicate);
                }
                outbound.insert(chunk_key.as_slice(), abort(encode(&chunk))?)?;

                let latency_ms = chunk.sent_at.map(|sent| (at - sent).num_milliseconds());
                let Some(raw_status) = statuses.get(status_key.as_slice())? else {
                    // Unframed messages have no aggregate row.
                    return Ok(ConfirmationOutcome::Confirmed {
                        confirmed_chunks: 1,
                        total_chunks: chunk.total_chunks,
                        completed: chunk.total_chunks == 1,
                        latency_ms,
                    });
                };
                let mut status: DeliveryStatus = abort(decode(&raw_status))?;
                let completed = status.record_confirmation(at);
                statuses.insert(status_key.as_slice(), abort(encode(&status))?)?;
                Ok(ConfirmationOutcome::Confirmed {
                    confirmed_chunks: status.confirmed_chunks,
                    total_chunks: status.total_chunks,
                    completed,
                    latency_ms,
                })
            },
        )?;
        if matches!(outcome, ConfirmationOutcome::Confirmed { .. }) {
            self.flush()?;
        }
        Ok(outcome)
    }

    fn get_status(&self, message_id: &MessageId) -> Result<Option<DeliveryStatus>, DeliveryError> {
        match self.statuses.get(status_key(message_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_status(
        &self,
        message_id: &MessageId,
        apply: &dyn Fn(&mut DeliveryStatus),
    ) -> Result<Option<DeliveryStatus>, DeliveryError> {
        let updated = update_in(&self.statuses, &status_key(message_id), apply)?;
        self.flush()?;
        Ok(updated)
    }

    fn list_statuses(&self) -> Result<Vec<DeliveryStatus>, DeliveryError> {
        scan(&self.statuses, b"")
    }

    fn insert_inbound_if_absent(&self, chunk: &InboundChunk) -> Result<bool, DeliveryError> {
        let key = chunk_key(&chunk.message_id, chunk.chunk_index);
        let stored = self
            .inbound
            .compare_and_swap(key, None::<&[u8]>, Some(encode(chunk)?))?
            .is_ok();
        if stored {
            self.flush()?;
        }
        Ok(stored)
    }

    fn inbound_chunks(&self, message_id: &MessageId) -> Result<Vec<InboundChunk>, DeliveryError> {
        scan(&self.inbound, &message_prefix(message_id))
    }

    fn discard_inbound(&self, message_id: &MessageId) -> Result<usize, DeliveryError> {
        let removed = Self::remove_prefix(&self.inbound, &message_prefix(message_id))?;
        self.flush()?;
        Ok(removed)
    }

    fn mark_completed_once(&self, message_id: &MessageId) -> Result<bool, DeliveryError> {
        let stamp = Utc::now().timestamp().to_be_bytes();
        let first = self
            .completed
            .compare_and_swap(status_key(message_id), None::<&[u8]>, Some(&stamp[..]))?
            .is_ok();
        if first {
            self.flush()?;
        }
        Ok(first)
    }

    fn is_completed(&self, message_id: &MessageId) -> Result<bool, DeliveryError> {
        Ok(self.completed.contains_key(status_key(message_id))?)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, DeliveryError> {
        let mut report = PurgeReport::default();

        let mut outbound: BTreeMap<MessageId, Vec<OutboundChunk>> = BTreeMap::new();
        for chunk in self.all_outbound()? {
            outbound.entry(chunk.message_id.clone()).or_default().push(chunk);
        }
        for (message_id, chunks) in outbound {
            let status = self.get_status(&message_id)?;
            let (active, last_activity) = match &status {
                Some(s) => (s.state == DeliveryState::InProgress, s.last_activity_at),
                None => (
                    chunks.iter().any(|c| c.status == ChunkStatus::Pending),
                    chunks
                        .iter()
                        .flat_map(|c| [Some(c.created_at), c.sent_at, c.confirmed_at])
                        .flatten()
                        .max()
                        .unwrap_or(cutoff),
                ),
            };
            if active || last_activity >= cutoff {
                continue;
            }
            report.outbound_chunks += Self::remove_prefix(&self.outbound, &message_prefix(&message_id))?;
            if status.is_some() {
                self.statuses.remove(status_key(&message_id))?;
                report.statuses += 1;
            }
        }

        let mut inbound: BTreeMap<MessageId, DateTime<Utc>> = BTreeMap::new();
        for chunk in scan::<InboundChunk>(&self.inbound, b"")? {
            let newest = inbound.entry(chunk.message_id.clone()).or_insert(chunk.received_at);
            if chunk.received_at > *newest {
                *newest = chunk.received_at;
            }
        }
        for (message_id, newest) in inbound {
            if newest < cutoff {
                report.inbound_chunks += Self::remove_prefix(&self.inbound, &message_prefix(&message_id))?;
            }
        }

        for entry in self.completed.iter() {
            let (key, value) = entry?;
            let stamp = <[u8; 8]>::try_from(value.as_ref())
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            if stamp < cutoff.timestamp() {
                self.completed.remove(key)?;
                report.completion_markers += 1;
            }
        }

        self.flush()?;
        Ok(report)
    }
}
