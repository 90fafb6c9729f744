use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of object storage event that produced a notification.
/// Only created-object variants result in work for the pipeline; everything
/// else is accepted and dropped at the ingress.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "OBJECT_CREATED")]
    ObjectCreated,
    #[serde(rename = "OBJECT_CREATED_PUT")]
    ObjectCreatedPut,
    #[serde(rename = "OBJECT_CREATED_COPY")]
    ObjectCreatedCopy,
    #[serde(rename = "OBJECT_REMOVED")]
    ObjectRemoved,
}

impl EventType {
    pub fn is_object_created(&self) -> bool {
        matches!(
            self,
            EventType::ObjectCreated | EventType::ObjectCreatedPut | EventType::ObjectCreatedCopy
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::ObjectCreated => write!(f, "OBJECT_CREATED"),
            EventType::ObjectCreatedPut => write!(f, "OBJECT_CREATED_PUT"),
            EventType::ObjectCreatedCopy => write!(f, "OBJECT_CREATED_COPY"),
            EventType::ObjectRemoved => write!(f, "OBJECT_REMOVED"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl FromStr for EventType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OBJECT_CREATED" => Ok(EventType::ObjectCreated),
            "OBJECT_CREATED_PUT" => Ok(EventType::ObjectCreatedPut),
            "OBJECT_CREATED_COPY" => Ok(EventType::ObjectCreatedCopy),
            "OBJECT_REMOVED" => Ok(EventType::ObjectRemoved),
            invalid => Err(ParseEventTypeError(invalid.to_owned())),
        }
    }
}

/// A notification emitted by the object store when an upload lands.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ObjectNotification {
    pub bucket: String,
    #[serde(rename = "objectKey")]
    pub object_key: String,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
}

/// A queue message wrapping a reference to one uploaded object.
/// One envelope may expand into many transaction records; it is not itself
/// a transaction.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub bucket: String,
    pub object_key: String,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(bucket: &str, object_key: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            object_key: object_key.to_owned(),
            received_at: Utc::now(),
        }
    }

    /// The owning user, taken from the first path segment of the object key.
    /// Uploads land under `"{userId}/{fileName}"`; a key without a user
    /// segment cannot be attributed and is malformed.
    pub fn user_id(&self) -> Option<&str> {
        match self.object_key.split_once('/') {
            Some((user_id, rest)) if !user_id.is_empty() && !rest.is_empty() => Some(user_id),
            _ => None,
        }
    }
}

impl From<ObjectNotification> for Envelope {
    fn from(notification: ObjectNotification) -> Self {
        Envelope::new(&notification.bucket, &notification.object_key)
    }
}
