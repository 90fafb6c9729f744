//! The delivery contract for envelope queues.
//!
//! Every implementation provides at-least-once delivery: an envelope that is
//! received but not acknowledged within the visibility timeout becomes
//! redeliverable, and an envelope received more times than the configured
//! ceiling moves to the dead-letter path instead of being redelivered
//! indefinitely. Consumers must treat every delivery as possibly-duplicate
//! and keep their effects idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::envelope::Envelope;

/// Enumeration of errors for operations on an envelope queue.
/// Database errors originate from sqlx and are wrapped to provide context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("no in-flight delivery for receipt {0}")]
    UnknownReceipt(i64),
}

/// An opaque handle identifying one delivery of one envelope.
/// Required to acknowledge or report a failure against that delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: i64,
}

/// One envelope handed to a consumer, together with its receipt and the
/// receive accounting needed to recognize the final attempt.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub receipt: Receipt,
    pub receive_count: i32,
    pub max_receives: i32,
}

impl Delivery {
    /// True when this delivery consumed the envelope's last receive:
    /// failing it now means the envelope will be dead-lettered rather than
    /// redelivered.
    pub fn is_final_receive(&self) -> bool {
        self.receive_count >= self.max_receives
    }
}

/// A message that exhausted its receive budget, retained for operator
/// inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub receive_count: i32,
    pub errors: Vec<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait EnvelopeQueue: Send + Sync {
    /// Make an envelope available for delivery.
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Receive up to `max_count` envelopes. Received envelopes are hidden
    /// from other consumers until the visibility timeout lapses. Envelopes
    /// that already consumed their receive budget are moved to the
    /// dead-letter path instead of being returned.
    async fn receive_batch(
        &self,
        consumer: &str,
        max_count: u32,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Mark a delivered envelope as fully processed. It will not be
    /// delivered again.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Record a processing error against a delivered envelope without
    /// acknowledging it. The envelope lapses back to available after the
    /// visibility timeout, carrying the error for later inspection.
    async fn record_failure(&self, receipt: &Receipt, error: &str) -> Result<(), QueueError>;

    /// List dead-lettered envelopes, oldest first.
    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError>;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum EntryState {
    Available,
    Acknowledged,
    DeadLettered,
}

#[derive(Debug)]
struct MemoryEntry {
    envelope: Envelope,
    state: EntryState,
    visible_at: Instant,
    receive_count: i32,
    errors: Vec<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

/// An in-memory queue with the same delivery semantics as the Postgres
/// implementation. Used to test consumers without a database.
#[derive(Clone)]
pub struct MemoryQueue {
    visibility_timeout: Duration,
    max_receives: i32,
    entries: Arc<Mutex<HashMap<i64, MemoryEntry>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, max_receives: i32) -> Self {
        Self {
            visibility_timeout,
            max_receives,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(0)),
        }
    }

    /// Make every in-flight delivery immediately visible again, as if its
    /// visibility timeout had lapsed. Lets tests exercise redelivery and
    /// dead-lettering without waiting out real timeouts.
    pub async fn expire_visibility(&self) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        for entry in entries.values_mut() {
            if entry.state == EntryState::Available {
                entry.visible_at = now;
            }
        }
    }

    /// Number of envelopes in the dead-letter state.
    pub async fn dead_letter_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.state == EntryState::DeadLettered)
            .count()
    }
}

#[async_trait]
impl EnvelopeQueue for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let id = *next_id;
        drop(next_id);

        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            MemoryEntry {
                envelope,
                state: EntryState::Available,
                visible_at: Instant::now(),
                receive_count: 0,
                errors: Vec::new(),
                dead_lettered_at: None,
            },
        );

        Ok(())
    }

    async fn receive_batch(
        &self,
        _consumer: &str,
        max_count: u32,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        // Envelopes that already used their receive budget are moved to the
        // dead-letter path instead of being redelivered.
        for entry in entries.values_mut() {
            if entry.state == EntryState::Available
                && entry.visible_at <= now
                && entry.receive_count >= self.max_receives
            {
                entry.state = EntryState::DeadLettered;
                entry.dead_lettered_at = Some(Utc::now());
            }
        }

        let mut ids: Vec<i64> = entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Available && e.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.truncate(max_count as usize);

        let mut deliveries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = entries.get_mut(&id).expect("entry id was just listed");
            entry.receive_count += 1;
            entry.visible_at = now + self.visibility_timeout;
            deliveries.push(Delivery {
                envelope: entry.envelope.clone(),
                receipt: Receipt { id },
                receive_count: entry.receive_count,
                max_receives: self.max_receives,
            });
        }

        Ok(deliveries)
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&receipt.id) {
            Some(entry) => {
                entry.state = EntryState::Acknowledged;
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt.id)),
        }
    }

    async fn record_failure(&self, receipt: &Receipt, error: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&receipt.id) {
            Some(entry) => {
                entry.errors.push(error.to_owned());
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt.id)),
        }
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<i64> = entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::DeadLettered)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit as usize);

        Ok(ids
            .into_iter()
            .map(|id| {
                let entry = &entries[&id];
                DeadLetter {
                    envelope: entry.envelope.clone(),
                    receive_count: entry.receive_count,
                    errors: entry.errors.clone(),
                    dead_lettered_at: entry
                        .dead_lettered_at
                        .expect("dead-lettered entry is missing its timestamp"),
                }
            })
            .collect())
    }
}
