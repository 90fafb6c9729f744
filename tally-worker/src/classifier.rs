//! The classification oracle client.
//!
//! Classification is remote and fallible; the client separates errors that
//! could resolve on retry (timeouts, 429 and any 5xx) from rejections that
//! will not. Retrying happens here, bounded by the envelope's processing
//! deadline, so the consumer sees a single outcome per draft.

use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use tally_common::retry::RetryPolicy;

use crate::error::EnvelopeError;

/// One draft's classification input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyRequest {
    pub user_id: String,
    pub date: String,
    pub amount_minor: i64,
    pub merchant: String,
    pub description: String,
    pub candidate_categories: Vec<String>,
}

/// The oracle's verdict. Confidence is its own estimate in `[0, 1]`; the
/// consumer compares it against the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category_id: String,
    pub confidence: f64,
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("classification failed but may succeed later: {0}")]
    Retryable(String),
    #[error("classification was rejected: {0}")]
    NonRetryable(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError>;
}

/// The HTTP classifier used in production.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: &str, timeout: time::Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Tally Categorization Worker")
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for the classifier");

        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClassifyError::Retryable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error = format!("classifier returned {status}");
            return if is_retryable_status(status) {
                Err(ClassifyError::Retryable(error))
            } else {
                Err(ClassifyError::NonRetryable(error))
            };
        }

        let classification: Classification = response
            .json()
            .await
            .map_err(|e| ClassifyError::NonRetryable(format!("undecodable response: {e}")))?;

        if !(0.0..=1.0).contains(&classification.confidence) {
            return Err(ClassifyError::NonRetryable(format!(
                "confidence {} is out of range",
                classification.confidence
            )));
        }

        Ok(classification)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Classify one draft, retrying transient oracle failures with backoff
/// until the deadline would be exceeded.
pub async fn classify_with_backoff(
    classifier: &dyn Classifier,
    request: &ClassifyRequest,
    retry_policy: &RetryPolicy,
    deadline: time::Duration,
) -> Result<Classification, EnvelopeError> {
    let started = tokio::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match classifier.classify(request).await {
            Ok(classification) => return Ok(classification),
            Err(ClassifyError::NonRetryable(error)) => {
                return Err(EnvelopeError::ClassifierRejected(error));
            }
            Err(ClassifyError::Retryable(error)) => {
                let interval = retry_policy.retry_interval(attempt);
                if started.elapsed() + interval >= deadline {
                    warn!(
                        "classification still unavailable after {} attempts: {}",
                        attempt + 1,
                        error
                    );
                    return Err(EnvelopeError::ClassifierUnavailable(error));
                }
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

/// A scripted classifier for tests. Classifications are looked up by
/// transaction description; unscripted descriptions are rejected.
#[derive(Clone, Default)]
pub struct FakeClassifier {
    responses: Arc<Mutex<std::collections::HashMap<String, Classification>>>,
    fail_next: Arc<Mutex<u32>>,
    calls: Arc<Mutex<u32>>,
}

impl FakeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, description: &str, category_id: &str, confidence: f64) {
        let mut responses = self.responses.lock().await;
        responses.insert(
            description.to_owned(),
            Classification {
                category_id: category_id.to_owned(),
                confidence,
            },
        );
    }

    /// Make the next `count` calls fail with a retryable error.
    pub async fn fake_fail(&self, count: u32) {
        let mut fail_next = self.fail_next.lock().await;
        *fail_next = count;
    }

    pub async fn call_count(&self) -> u32 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError> {
        let mut calls = self.calls.lock().await;
        *calls += 1;
        drop(calls);

        let mut fail_next = self.fail_next.lock().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(ClassifyError::Retryable("injected failure".to_owned()));
        }
        drop(fail_next);

        let responses = self.responses.lock().await;
        match responses.get(&request.description) {
            Some(classification) => Ok(classification.clone()),
            None => Err(ClassifyError::NonRetryable(format!(
                "no category for {}",
                request.description
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str) -> ClassifyRequest {
        ClassifyRequest {
            user_id: "user-1".to_owned(),
            date: "2024-03-02".to_owned(),
            amount_minor: -1250,
            merchant: "Corner Cafe".to_owned(),
            description: description.to_owned(),
            candidate_categories: vec!["Food".to_owned(), "Transportation".to_owned()],
        }
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_backoff_recovers_from_transient_failures() {
        let classifier = FakeClassifier::new();
        classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        classifier.fake_fail(2).await;

        let policy = RetryPolicy::new(2, time::Duration::from_millis(1), None);
        let classification = classify_with_backoff(
            &classifier,
            &request("CORNER CAFE 0042"),
            &policy,
            time::Duration::from_secs(5),
        )
        .await
        .expect("classification failed");

        assert_eq!(classification.category_id, "Food");
        assert_eq!(classifier.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_at_the_deadline() {
        let classifier = FakeClassifier::new();
        classifier.fake_fail(u32::MAX).await;

        let policy = RetryPolicy::new(2, time::Duration::from_millis(20), None);
        let result = classify_with_backoff(
            &classifier,
            &request("CORNER CAFE 0042"),
            &policy,
            time::Duration::from_millis(50),
        )
        .await;

        assert!(matches!(
            result,
            Err(EnvelopeError::ClassifierUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let classifier = FakeClassifier::new();

        let policy = RetryPolicy::default();
        let result = classify_with_backoff(
            &classifier,
            &request("UNKNOWN MERCHANT"),
            &policy,
            time::Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(EnvelopeError::ClassifierRejected(_))));
        assert_eq!(classifier.call_count().await, 1);
    }
}
