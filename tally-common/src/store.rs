//! Storage contracts for transaction and category records.
//!
//! All pipeline mutation goes through `TransactionStore::upsert`, a
//! key-scoped conditional write that is safe to apply any number of times.
//! The category store is read-only from the pipeline's perspective.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::category::UserCategories;
use crate::transaction::TransactionRecord;

/// Enumeration of errors for operations on the stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The result of an idempotent upsert.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UpsertOutcome {
    /// The write was applied.
    Applied,
    /// The stored record is already terminal; the write was dropped and the
    /// existing state kept. A duplicate delivery lands here and is treated
    /// as success.
    SkippedTerminal,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Conditionally write a record keyed by `(user_id, transaction_date_id)`.
    ///
    /// The write is a monotonic state transition, not a blind overwrite: a
    /// record whose stored status is terminal is never modified, so a late
    /// duplicate delivery cannot regress it to `PendingCategorization`.
    async fn upsert(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError>;

    async fn get(
        &self,
        user_id: &str,
        transaction_date_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    /// Scan of work-in-progress records via the non-terminal-status index.
    async fn list_in_progress(&self, limit: u32) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Scan of records awaiting human review via the pending-validation index.
    async fn list_pending_validation(
        &self,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError>;
}

#[async_trait]
pub trait CategoryStore: Send + Sync {
    /// The user's configured taxonomy, or None if they have not set one up.
    async fn user_categories(&self, user_id: &str)
        -> Result<Option<UserCategories>, StoreError>;
}

/// An in-memory transaction store with the same upsert semantics as the
/// Postgres implementation. Used to test consumers without a database.
#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    records: Arc<Mutex<HashMap<(String, String), TransactionRecord>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail, to simulate a transient outage.
    pub async fn fake_fail_upserts(&self, count: u32) {
        let mut fail_next = self.fail_next.lock().await;
        *fail_next = count;
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn upsert(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        let mut fail_next = self.fail_next.lock().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        drop(fail_next);

        let mut records = self.records.lock().await;
        let key = (record.user_id.clone(), record.transaction_date_id.clone());

        match records.get(&key) {
            Some(existing) if existing.status.is_terminal() => Ok(UpsertOutcome::SkippedTerminal),
            _ => {
                records.insert(key, record.clone());
                Ok(UpsertOutcome::Applied)
            }
        }
    }

    async fn get(
        &self,
        user_id: &str,
        transaction_date_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(user_id.to_owned(), transaction_date_id.to_owned()))
            .cloned())
    }

    async fn list_in_progress(&self, limit: u32) -> Result<Vec<TransactionRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut in_progress: Vec<TransactionRecord> = records
            .values()
            .filter(|r| r.non_terminal_status().is_some())
            .cloned()
            .collect();
        in_progress.sort_by(|a, b| a.transaction_date_id.cmp(&b.transaction_date_id));
        in_progress.truncate(limit as usize);
        Ok(in_progress)
    }

    async fn list_pending_validation(
        &self,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut pending: Vec<TransactionRecord> = records
            .values()
            .filter(|r| r.pending_validation)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.transaction_date_id.cmp(&b.transaction_date_id));
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

/// An in-memory category store for tests.
#[derive(Clone, Default)]
pub struct MemoryCategoryStore {
    categories: Arc<Mutex<HashMap<String, UserCategories>>>,
}

impl MemoryCategoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, categories: UserCategories) {
        let mut map = self.categories.lock().await;
        map.insert(categories.user_id.clone(), categories);
    }
}

#[async_trait]
impl CategoryStore for MemoryCategoryStore {
    async fn user_categories(
        &self,
        user_id: &str,
    ) -> Result<Option<UserCategories>, StoreError> {
        let map = self.categories.lock().await;
        Ok(map.get(user_id).cloned())
    }
}
