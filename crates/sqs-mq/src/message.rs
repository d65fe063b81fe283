//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Maximum length of a remote queue name
pub const MAX_QUEUE_NAME_LENGTH: usize = 80;

/// Prefix shared by all temporary (request/reply) queue names after normalization
pub const TEMP_QUEUE_PREFIX: &str = "mq-tmp-";

/// Replace the characters the remote service rejects in queue names.
///
/// `.`, `:` and space become `-`; every other character is left untouched.
/// Applying the function twice gives the same result as applying it once.
pub fn to_valid_queue_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | ':' | ' ' => '-',
            other => other,
        })
        .collect()
}

/// Validated, remote-service-safe queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name, normalizing disallowed separators first
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = to_valid_queue_name(&name.into());

        if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} characters", MAX_QUEUE_NAME_LENGTH),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Recover the queue name from a queue URL (its last path segment)
    pub fn from_queue_url(queue_url: &str) -> Result<Self, ValidationError> {
        let name = queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        Self::new(name)
    }

    /// Whether this name follows the temporary-queue naming convention
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_QUEUE_PREFIX)
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Derives the per-message-type queue names used by the message server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    prefix: String,
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Inbound queue the workers of `message_type` consume from
    pub fn in_queue(&self, message_type: &str) -> Result<QueueName, ValidationError> {
        self.resolve(message_type, "inq")
    }

    /// Queue receiving handler results when the request carried no `ReplyTo`
    pub fn out_queue(&self, message_type: &str) -> Result<QueueName, ValidationError> {
        self.resolve(message_type, "outq")
    }

    /// Dead-letter queue for messages that exhausted their retries
    pub fn dead_letter_queue(&self, message_type: &str) -> Result<QueueName, ValidationError> {
        self.resolve(message_type, "dlq")
    }

    /// Fresh, unique temporary queue name for a request/reply exchange
    pub fn temp_queue(&self) -> QueueName {
        // Temporary queues ignore the configured prefix so the sweep can find them.
        let id = uuid::Uuid::new_v4().simple();
        QueueName(format!("{}{}-inq", TEMP_QUEUE_PREFIX, id))
    }

    fn resolve(&self, message_type: &str, suffix: &str) -> Result<QueueName, ValidationError> {
        QueueName::new(format!("{}:{}.{}", self.prefix, message_type, suffix))
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self::new("mq")
    }
}

/// Identifier the remote service assigns to each stored message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from seconds since the Unix epoch
    pub fn from_epoch_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Seconds since the Unix epoch
    pub fn epoch_seconds(&self) -> i64 {
        self.0.timestamp()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

/// Opaque, single-use token required to delete or change the visibility of
/// one specific delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent through the queue system.
///
/// The body is opaque: nothing in this crate parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
    pub reply_to: Option<QueueName>,
    pub meta: HashMap<String, String>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            attributes: HashMap::new(),
            reply_to: None,
            meta: HashMap::new(),
        }
    }

    /// Add message attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Route the handler's result to this queue instead of the type's out queue
    pub fn with_reply_to(mut self, queue: QueueName) -> Self {
        self.reply_to = Some(queue);
        self
    }

    /// Add free-form metadata
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Body interpreted as UTF-8 text
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A message received from the queue with processing metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub queue_url: String,
    pub receipt_handle: ReceiptHandle,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
    pub reply_to: Option<QueueName>,
    pub meta: HashMap<String, String>,
    /// How many times the remote service has handed this message out, this delivery included
    pub receive_count: u32,
    pub sent_at: Timestamp,
}

impl ReceivedMessage {
    /// Convert back to Message (for forwarding/replaying)
    pub fn message(&self) -> Message {
        Message {
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            reply_to: self.reply_to.clone(),
            meta: self.meta.clone(),
        }
    }

    /// Body interpreted as UTF-8 text
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Check if message has been delivered more often than `max_count`
    pub fn has_exceeded_receive_count(&self, max_count: u32) -> bool {
        self.receive_count > max_count
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
