use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid TransactionStatus")]
pub struct ParseTransactionStatusError(pub String);

/// Enumeration of possible statuses for a transaction record.
///
/// The lifecycle is one-directional: a record is created as
/// `PendingCategorization` and moves to exactly one of the terminal states.
/// Nothing in the pipeline returns a terminal record to pending; only an
/// external re-ingestion action may do that.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Record created from a parsed upload line, awaiting classification.
    PendingCategorization,
    /// Classified with confidence at or above the configured threshold.
    Categorized,
    /// Classified below the confidence threshold; a human must confirm.
    AwaitingValidation,
    /// The owning envelope exhausted its receive budget.
    DeadLettered,
}

impl TransactionStatus {
    /// Terminal states never move back to `PendingCategorization` through
    /// the pipeline's upsert path.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::PendingCategorization)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionStatus::PendingCategorization => write!(f, "pending_categorization"),
            TransactionStatus::Categorized => write!(f, "categorized"),
            TransactionStatus::AwaitingValidation => write!(f, "awaiting_validation"),
            TransactionStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseTransactionStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_categorization" => Ok(TransactionStatus::PendingCategorization),
            "categorized" => Ok(TransactionStatus::Categorized),
            "awaiting_validation" => Ok(TransactionStatus::AwaitingValidation),
            "dead_lettered" => Ok(TransactionStatus::DeadLettered),
            invalid => Err(ParseTransactionStatusError(invalid.to_owned())),
        }
    }
}

/// A transaction before classification, as parsed from one upload line.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub user_id: String,
    pub transaction_date_id: String,
    pub date: String,
    pub amount_minor: i64,
    pub merchant: String,
    pub description: String,
}

/// The unit of work and of storage, keyed by `(user_id, transaction_date_id)`.
///
/// `transaction_date_id` is a sortable string combining the transaction date
/// with a disambiguating sequence, so records are naturally date-ordered and
/// same-day transactions do not collide.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub user_id: String,
    pub transaction_date_id: String,
    pub date: String,
    pub amount_minor: i64,
    pub merchant: String,
    pub description: String,
    pub category_id: Option<String>,
    pub confidence: Option<f64>,
    pub status: TransactionStatus,
    pub pending_validation: bool,
}

impl TransactionRecord {
    /// Build the record as first created from a parsed upload line.
    pub fn pending(draft: &TransactionDraft) -> Self {
        Self {
            user_id: draft.user_id.clone(),
            transaction_date_id: draft.transaction_date_id.clone(),
            date: draft.date.clone(),
            amount_minor: draft.amount_minor,
            merchant: draft.merchant.clone(),
            description: draft.description.clone(),
            category_id: None,
            confidence: None,
            status: TransactionStatus::PendingCategorization,
            pending_validation: false,
        }
    }

    /// Build the committed record for a classification outcome.
    /// Confidence below `threshold` is a valid terminal outcome requiring
    /// human review, not an error.
    pub fn classified(
        draft: &TransactionDraft,
        category_id: &str,
        confidence: f64,
        threshold: f64,
    ) -> Self {
        let (status, pending_validation) = if confidence >= threshold {
            (TransactionStatus::Categorized, false)
        } else {
            (TransactionStatus::AwaitingValidation, true)
        };

        Self {
            user_id: draft.user_id.clone(),
            transaction_date_id: draft.transaction_date_id.clone(),
            date: draft.date.clone(),
            amount_minor: draft.amount_minor,
            merchant: draft.merchant.clone(),
            description: draft.description.clone(),
            category_id: Some(category_id.to_owned()),
            confidence: Some(confidence),
            status,
            pending_validation,
        }
    }

    /// Build the record committed when the owning envelope exhausts its
    /// receive budget.
    pub fn dead_lettered(draft: &TransactionDraft) -> Self {
        Self {
            status: TransactionStatus::DeadLettered,
            pending_validation: false,
            ..Self::pending(draft)
        }
    }

    /// The derived index attribute mirroring status while non-terminal.
    /// Absent once terminal, so the index only contains work in progress.
    pub fn non_terminal_status(&self) -> Option<TransactionStatus> {
        if self.status.is_terminal() {
            None
        } else {
            Some(self.status)
        }
    }
}
