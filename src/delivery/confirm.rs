//! Peer confirmation bookkeeping on the sender side.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

use super::errors::DeliveryError;
use super::types::{ConfirmationOutcome, MessageId};
use crate::metrics;
use crate::storage::DeliveryStore;

#[derive(Clone)]
pub struct ConfirmationProcessor {
    store: Arc<dyn DeliveryStore>,
}

impl ConfirmationProcessor {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    /// Apply one confirmation. Duplicates and confirmations for chunks this
    /// node never sent change nothing and are not errors.
    pub fn on_confirmation(
        &self,
        message_id: &MessageId,
        chunk_index: u32,
    ) -> Result<ConfirmationOutcome, DeliveryError> {
        let outcome = self
            .store
            .confirm_outbound(message_id, chunk_index, Utc::now())?;
        match &outcome {
            ConfirmationOutcome::Confirmed {
                confirmed_chunks,
                total_chunks,
                completed,
                latency_ms,
            } => {
                metrics::inc_confirmations_new();
                if let Some(ms) = latency_ms {
                    metrics::observe_confirm_latency(*ms);
                }
                debug!(
                    "Chunk {} of id={} confirmed ({}/{})",
                    chunk_index, message_id, confirmed_chunks, total_chunks
                );
                if *completed {
                    metrics::inc_messages_completed();
                    info!(
                        "Message id={} delivered: all {} chunks confirmed",
                        message_id, total_chunks
                    );
                }
            }
            ConfirmationOutcome::Duplicate => {
                metrics::inc_confirmations_duplicate();
                debug!("Duplicate confirmation for chunk {} of id={}", chunk_index, message_id);
            }
            ConfirmationOutcome::Unknown => {
                metrics::inc_confirmations_unknown();
                let err = DeliveryError::UnknownConfirmation {
                    message_id: message_id.clone(),
                    chunk_index,
                };
                warn!("Ignoring confirmation: {}", err);
            }
        }
        Ok(outcome)
    }
}
