//! Parsing uploaded CSV statements into transaction drafts.
//!
//! Every draft gets a deterministic `transaction_date_id` derived from the
//! object key and the line's position in the file, so re-parsing the same
//! upload always produces the same record keys and redeliveries collapse
//! into idempotent upserts.

use chrono::NaiveDate;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use tally_common::envelope::Envelope;
use tally_common::transaction::TransactionDraft;

use crate::error::EnvelopeError;

const REQUIRED_COLUMNS: [&str; 4] = ["date", "amount", "merchant", "description"];

#[derive(Debug, Deserialize)]
struct UploadRow {
    date: String,
    amount: String,
    merchant: String,
    description: String,
}

/// Parse the CSV content of one uploaded object into drafts.
///
/// The whole file parses or the whole file fails: a single malformed line
/// fails the envelope rather than silently dropping the line. An upload
/// with a valid header and no data rows parses to an empty batch.
pub fn parse_upload(envelope: &Envelope, content: &str) -> Result<Vec<TransactionDraft>, EnvelopeError> {
    let user_id = envelope
        .user_id()
        .ok_or_else(|| EnvelopeError::UnattributableKey(envelope.object_key.clone()))?;

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(|_| EnvelopeError::MissingHeader)?
        .clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(EnvelopeError::MissingHeader);
        }
    }

    let key_digest = object_key_digest(&envelope.object_key);

    let mut drafts = Vec::new();
    for (index, row) in reader.deserialize::<UploadRow>().enumerate() {
        let line = index as u64 + 1;
        let row = row.map_err(|e| EnvelopeError::MalformedLine {
            line,
            reason: e.to_string(),
        })?;

        NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").map_err(|_| {
            EnvelopeError::MalformedLine {
                line,
                reason: format!("{} is not a valid date", row.date),
            }
        })?;

        let amount_minor =
            parse_amount_minor(&row.amount).ok_or_else(|| EnvelopeError::MalformedLine {
                line,
                reason: format!("{} is not a valid amount", row.amount),
            })?;

        drafts.push(TransactionDraft {
            user_id: user_id.to_owned(),
            transaction_date_id: format!("{}#{}-{:04}", row.date, key_digest, line),
            date: row.date,
            amount_minor,
            merchant: row.merchant,
            description: row.description,
        });
    }

    Ok(drafts)
}

/// The first 8 hex characters of the object key's SHA-256, disambiguating
/// same-day transactions from different uploads without breaking date order.
fn object_key_digest(object_key: &str) -> String {
    let digest = Sha256::digest(object_key.as_bytes());
    format!("{digest:x}")[..8].to_owned()
}

/// Parse a decimal amount string into minor units, e.g. "-12.50" to -1250.
/// At most two fractional digits are accepted; "12.5" means 12.50.
fn parse_amount_minor(amount: &str) -> Option<i64> {
    let amount = amount.trim();
    let (negative, unsigned) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount),
    };

    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (unsigned, ""),
    };

    if whole.is_empty() || fraction.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole = whole.parse::<i64>().ok()?;
    let cents = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse::<i64>().ok()?,
    };

    let minor = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -minor } else { minor })
}
