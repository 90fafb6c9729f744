//! # PgEnvelopeQueue
//!
//! An envelope queue implemented on top of a PostgreSQL table.
//!
//! Delivery hides an envelope by pushing `visible_at` past the visibility
//! timeout; an unacknowledged envelope lapses back into view and is
//! redelivered. An envelope that lapses after consuming its receive budget
//! is moved to the dead-letter state on the next receive cycle rather than
//! redelivered.

use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::envelope::Envelope;
use crate::queue::{DeadLetter, Delivery, EnvelopeQueue, QueueError, Receipt};

/// Enumeration of possible statuses for a queued envelope.
#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "envelope_status")]
#[sqlx(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Waiting in the queue, or in flight within its visibility timeout.
    Available,
    /// Fully processed; will not be delivered again.
    Acknowledged,
    /// Exhausted its receive budget; retained for operator inspection.
    DeadLettered,
}

#[derive(sqlx::FromRow)]
struct EnvelopeRow {
    id: i64,
    bucket: String,
    object_key: String,
    received_at: DateTime<Utc>,
    receive_count: i32,
    errors: Vec<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl EnvelopeRow {
    fn envelope(&self) -> Envelope {
        Envelope {
            bucket: self.bucket.clone(),
            object_key: self.object_key.clone(),
            received_at: self.received_at,
        }
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgEnvelopeQueue {
    /// A name to identify this queue as multiple may share a table.
    name: String,
    /// Interval a delivered envelope stays hidden from other consumers.
    visibility_timeout: time::Duration,
    /// Receive-count ceiling before an envelope is dead-lettered.
    max_receives: i32,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

impl PgEnvelopeQueue {
    /// Initialize a queue by creating a connection pool to the database in `url`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
        visibility_timeout: time::Duration,
        max_receives: i32,
    ) -> Result<Self, QueueError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| QueueError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            name: queue_name.to_owned(),
            visibility_timeout,
            max_receives,
            pool,
        })
    }

    /// Initialize a queue from a provided connection pool.
    pub fn new_from_pool(
        queue_name: &str,
        pool: PgPool,
        visibility_timeout: time::Duration,
        max_receives: i32,
    ) -> Self {
        Self {
            name: queue_name.to_owned(),
            visibility_timeout,
            max_receives,
            pool,
        }
    }
}

#[async_trait]
impl EnvelopeQueue for PgEnvelopeQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let base_query = r#"
INSERT INTO envelope_queue
    (queue, status, bucket, object_key, received_at, visible_at, receive_count)
VALUES
    ($1, 'available'::envelope_status, $2, $3, $4, NOW(), 0)
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(&envelope.bucket)
            .bind(&envelope.object_key)
            .bind(envelope.received_at)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn receive_batch(
        &self,
        consumer: &str,
        max_count: u32,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        // Lapsed envelopes that consumed their receive budget move to the
        // dead-letter state instead of being redelivered.
        let dead_letter_query = r#"
UPDATE
    envelope_queue
SET
    status = 'dead_lettered'::envelope_status,
    dead_lettered_at = NOW()
WHERE
    queue = $1
    AND status = 'available'
    AND visible_at <= NOW()
    AND receive_count >= $2
        "#;

        sqlx::query(dead_letter_query)
            .bind(&self.name)
            .bind(self.max_receives)
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        // The query that follows uses a FOR UPDATE SKIP LOCKED clause.
        // For more details on this see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
        let receive_query = r#"
WITH visible_in_queue AS (
    SELECT
        id
    FROM
        envelope_queue
    WHERE
        queue = $1
        AND status = 'available'
        AND visible_at <= NOW()
        AND receive_count < $2
    ORDER BY
        id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE
    envelope_queue
SET
    visible_at = NOW() + $4,
    receive_count = envelope_queue.receive_count + 1,
    received_by = array_append(envelope_queue.received_by, $5::text)
FROM
    visible_in_queue
WHERE
    envelope_queue.id = visible_in_queue.id
RETURNING
    envelope_queue.*
        "#;

        let rows: Vec<EnvelopeRow> = sqlx::query_as(receive_query)
            .bind(&self.name)
            .bind(self.max_receives)
            .bind(max_count as i64)
            .bind(self.visibility_timeout)
            .bind(consumer)
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| QueueError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(rows
            .into_iter()
            .map(|row| Delivery {
                envelope: row.envelope(),
                receipt: Receipt { id: row.id },
                receive_count: row.receive_count,
                max_receives: self.max_receives,
            })
            .collect())
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE
    envelope_queue
SET
    status = 'acknowledged'::envelope_status,
    acknowledged_at = NOW()
WHERE
    queue = $1
    AND id = $2
    AND status = 'available'
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(receipt.id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt.id));
        }

        Ok(())
    }

    async fn record_failure(&self, receipt: &Receipt, error: &str) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE
    envelope_queue
SET
    errors = array_append(errors, $3::text)
WHERE
    queue = $1
    AND id = $2
    AND status = 'available'
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(receipt.id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt.id));
        }

        Ok(())
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError> {
        let base_query = r#"
SELECT
    *
FROM
    envelope_queue
WHERE
    queue = $1
    AND status = 'dead_lettered'
ORDER BY
    dead_lettered_at
LIMIT $2
        "#;

        let rows: Vec<EnvelopeRow> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .map(|row| DeadLetter {
                envelope: row.envelope(),
                receive_count: row.receive_count,
                errors: row.errors.clone(),
                dead_lettered_at: row.dead_lettered_at.unwrap_or(row.received_at),
            })
            .collect())
    }
}
