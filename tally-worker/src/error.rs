use thiserror::Error;

use tally_common::queue::QueueError;
use tally_common::store::StoreError;

/// Enumeration of errors that fail one envelope without stopping the
/// consumer. A failed envelope is left unacknowledged so the queue
/// redelivers or dead-letters it by receive count.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("object key {0} has no user segment")]
    UnattributableKey(String),
    #[error("could not read object {key}: {reason}")]
    ObjectReadError { key: String, reason: String },
    #[error("line {line} of the upload is malformed: {reason}")]
    MalformedLine { line: u64, reason: String },
    #[error("the upload has no usable header row")]
    MissingHeader,
    #[error("classification was unavailable: {0}")]
    ClassifierUnavailable(String),
    #[error("classification was rejected: {0}")]
    ClassifierRejected(String),
    #[error("ran out of time processing the envelope")]
    DeadlineExceeded,
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// Enumeration of errors that stop the consumer loop itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while consuming envelopes")]
    QueueError(#[from] QueueError),
    #[error("worker configuration is invalid: {0}")]
    ConfigError(String),
}
