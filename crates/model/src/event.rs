use aws_lambda_events::s3::S3Event;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Longest key object storage accepts.
const MAX_KEY_BYTES: usize = 1024;

/// Identifier of an uploaded object, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn parse(key: impl Into<String>) -> Result<Self, EventError> {
        let key: String = key.into();

        if key.is_empty() {
            return Err(EventError::EmptyKey);
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(EventError::KeyTooLong(key.len()));
        }
        if key.chars().any(char::is_control) {
            return Err(EventError::ControlCharacter);
        }

        Ok(ObjectKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ObjectKey::parse(value)
    }
}

impl From<ObjectKey> for String {
    fn from(value: ObjectKey) -> Self {
        value.0
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reasons a queue message can never be processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("message has no body")]
    EmptyBody,
    #[error("message body is not a valid upload event: {0}")]
    Malformed(String),
    #[error("message body does not carry an object key")]
    MissingKey,
    #[error("notification carries {0} records, expected one")]
    MultipleRecords(usize),
    #[error("object key is empty")]
    EmptyKey,
    #[error("object key is {0} bytes, over the {MAX_KEY_BYTES} byte limit")]
    KeyTooLong(usize),
    #[error("object key contains control characters")]
    ControlCharacter,
}

/// Storage-change notification which seeds one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    pub object_key: ObjectKey,
}

// The canonical `{"objectKey": ..}` body, or the `{"object": {"key": ..}}`
// shape of R2 notifications.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUploadEvent {
    object_key: Option<String>,
    object: Option<RawObject>,
}

#[derive(Deserialize)]
struct RawObject {
    key: Option<String>,
}

impl UploadEvent {
    pub fn new(object_key: ObjectKey) -> Self {
        UploadEvent { object_key }
    }

    /// Parse a queue message body.
    ///
    /// S3 event notifications (`{"Records": [..]}`) must carry exactly one
    /// record. Their keys arrive form-URL encoded and are decoded here.
    pub fn from_body(body: &str) -> Result<Self, EventError> {
        if body.trim().is_empty() {
            return Err(EventError::EmptyBody);
        }

        let value: Value = serde_json::from_str(body).map_err(malformed)?;

        let key: String = if value.get("Records").is_some() {
            notification_key(serde_json::from_value(value).map_err(malformed)?)?
        } else {
            let raw: RawUploadEvent = serde_json::from_value(value).map_err(malformed)?;

            raw.object_key
                .or_else(|| raw.object.and_then(|object| object.key))
                .ok_or(EventError::MissingKey)?
        };

        Ok(UploadEvent::new(ObjectKey::parse(key)?))
    }

    pub fn to_body(&self) -> String {
        serde_json::json!({ "objectKey": self.object_key.as_str() }).to_string()
    }
}

fn malformed(err: serde_json::Error) -> EventError {
    EventError::Malformed(err.to_string())
}

fn notification_key(event: S3Event) -> Result<String, EventError> {
    let count: usize = event.records.len();
    if count > 1 {
        return Err(EventError::MultipleRecords(count));
    }

    let encoded: String = event
        .records
        .into_iter()
        .next()
        .and_then(|record| record.s3.object.key)
        .ok_or(EventError::MissingKey)?;

    // '+' is a space in form encoding, '%2B' a literal plus
    let decoded: String = percent_decode_str(&encoded.replace('+', " "))
        .decode_utf8()
        .map_err(|err| EventError::Malformed(format!("object key is not valid UTF-8: {err}")))?
        .into_owned();

    Ok(decoded)
}
