//! PostgreSQL-backed transaction and category stores.
//!
//! The upsert is a single conditional `INSERT ... ON CONFLICT` whose update
//! arm only fires while the stored row is non-terminal; the key-scoped
//! conditional write is the pipeline's sole concurrency-control primitive.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::category::{CategoryGroup, UserCategories};
use crate::store::{CategoryStore, StoreError, TransactionStore, UpsertOutcome};
use crate::transaction::{TransactionRecord, TransactionStatus};

/// Build a lazy connection pool shared by the queue and the stores.
pub fn build_pool(
    url: &str,
    max_connections: u32,
    app_name: &'static str,
) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|error| StoreError::PoolCreationError { error })?
        .application_name(app_name);

    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy_with(options))
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    user_id: String,
    transaction_date_id: String,
    date: String,
    amount_minor: i64,
    merchant: String,
    description: String,
    category_id: Option<String>,
    confidence: Option<f64>,
    status: TransactionStatus,
    pending_validation: bool,
}

impl From<TransactionRow> for TransactionRecord {
    fn from(row: TransactionRow) -> Self {
        TransactionRecord {
            user_id: row.user_id,
            transaction_date_id: row.transaction_date_id,
            date: row.date,
            amount_minor: row.amount_minor,
            merchant: row.merchant,
            description: row.description,
            category_id: row.category_id,
            confidence: row.confidence,
            status: row.status,
            pending_validation: row.pending_validation,
        }
    }
}

/// Transaction records in a PostgreSQL table, keyed by
/// `(user_id, transaction_date_id)`.
#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn upsert(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        // The update arm is guarded on the stored row still being
        // non-terminal, so a duplicate delivery cannot regress a terminal
        // status; the guard failing is a successful no-op.
        let base_query = r#"
INSERT INTO transactions
    (user_id, transaction_date_id, date, amount_minor, merchant, description,
     category_id, confidence, status, non_terminal_status, pending_validation)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (user_id, transaction_date_id) DO UPDATE
SET
    category_id = EXCLUDED.category_id,
    confidence = EXCLUDED.confidence,
    status = EXCLUDED.status,
    non_terminal_status = EXCLUDED.non_terminal_status,
    pending_validation = EXCLUDED.pending_validation,
    updated_at = NOW()
WHERE
    transactions.non_terminal_status IS NOT NULL
        "#;

        let result = sqlx::query(base_query)
            .bind(&record.user_id)
            .bind(&record.transaction_date_id)
            .bind(&record.date)
            .bind(record.amount_minor)
            .bind(&record.merchant)
            .bind(&record.description)
            .bind(&record.category_id)
            .bind(record.confidence)
            .bind(record.status)
            .bind(record.non_terminal_status())
            .bind(record.pending_validation)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::SkippedTerminal)
        } else {
            Ok(UpsertOutcome::Applied)
        }
    }

    async fn get(
        &self,
        user_id: &str,
        transaction_date_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let base_query = r#"
SELECT
    *
FROM
    transactions
WHERE
    user_id = $1
    AND transaction_date_id = $2
        "#;

        let row: Option<TransactionRow> = sqlx::query_as(base_query)
            .bind(user_id)
            .bind(transaction_date_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(row.map(TransactionRecord::from))
    }

    async fn list_in_progress(&self, limit: u32) -> Result<Vec<TransactionRecord>, StoreError> {
        let base_query = r#"
SELECT
    *
FROM
    transactions
WHERE
    non_terminal_status IS NOT NULL
ORDER BY
    transaction_date_id
LIMIT $1
        "#;

        let rows: Vec<TransactionRow> = sqlx::query_as(base_query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(TransactionRecord::from).collect())
    }

    async fn list_pending_validation(
        &self,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let base_query = r#"
SELECT
    *
FROM
    transactions
WHERE
    pending_validation
ORDER BY
    transaction_date_id
LIMIT $1
        "#;

        let rows: Vec<TransactionRow> = sqlx::query_as(base_query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(TransactionRecord::from).collect())
    }
}

/// Per-user category definitions in a PostgreSQL table, stored as JSONB.
#[derive(Clone)]
pub struct PgCategoryStore {
    pool: PgPool,
}

impl PgCategoryStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CategoryStore for PgCategoryStore {
    async fn user_categories(
        &self,
        user_id: &str,
    ) -> Result<Option<UserCategories>, StoreError> {
        let base_query = r#"
SELECT
    categories
FROM
    categories
WHERE
    user_id = $1
        "#;

        let row: Option<(sqlx::types::Json<Vec<CategoryGroup>>,)> = sqlx::query_as(base_query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(row.map(|(categories,)| UserCategories {
            user_id: user_id.to_owned(),
            categories: categories.0,
        }))
    }
}
