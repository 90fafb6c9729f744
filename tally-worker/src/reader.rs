//! Reading uploaded statement files out of object storage.
//!
//! Trait-based so the consumer can be tested against an in-memory
//! implementation without an object store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client as AwsS3SdkClient;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectReadError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store operation failed: {0}")]
    OperationFailed(String),
    #[error("object body is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// Read-only access to uploaded objects, addressed by bucket and key.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Fetch an object's content as a UTF-8 string.
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ObjectReadError>;
}

/// The S3-backed reader used in production.
pub struct S3ObjectReader {
    client: AwsS3SdkClient,
}

impl S3ObjectReader {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a reader from the ambient AWS environment configuration.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(AwsS3SdkClient::new(&config))
    }
}

#[async_trait]
impl ObjectReader for S3ObjectReader {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ObjectReadError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get object: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    ObjectReadError::NotFound(key.to_string())
                } else {
                    ObjectReadError::OperationFailed(message)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectReadError::OperationFailed(format!("failed to read body: {e}")))?;

        String::from_utf8(body.to_vec()).map_err(|e| ObjectReadError::NotUtf8(e.to_string()))
    }
}

/// An in-memory reader for tests. Unregistered keys read as not found.
#[derive(Clone, Default)]
pub struct MemoryObjectReader {
    objects: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryObjectReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, bucket: &str, key: &str, content: &str) {
        let mut objects = self.objects.lock().await;
        objects.insert(format!("{bucket}:{key}"), content.to_owned());
    }
}

#[async_trait]
impl ObjectReader for MemoryObjectReader {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ObjectReadError> {
        let objects = self.objects.lock().await;
        match objects.get(&format!("{bucket}:{key}")) {
            Some(content) => Ok(content.clone()),
            None => Err(ObjectReadError::NotFound(key.to_string())),
        }
    }
}
