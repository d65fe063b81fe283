//! Remote queue service interface and the batch types it exchanges.
//!
//! [`SqsClient`] is the single seam between this crate and the remote,
//! at-least-once queuing service. Everything above it (queue manager, buffers,
//! message server) is written against the trait, so the in-memory provider and
//! the AWS provider are interchangeable.

use crate::error::{BatchConstraintViolation, BatchItemError, QueueError};
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{ProviderConfig, ProviderType};
use crate::providers::{AwsSqsProvider, InMemorySqs};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

// ============================================================================
// Protocol Limits
// ============================================================================

/// Maximum entries per batched send/delete/change-visibility call
pub const MAX_BATCH_SIZE: usize = 10;

/// Maximum messages returned by one receive call
pub const MAX_RECEIVE_MESSAGES: u32 = 10;

/// Maximum visibility timeout in seconds (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 43_200;

/// Maximum long-poll wait in seconds
pub const MAX_RECEIVE_WAIT_SECS: u32 = 20;

/// Maximum message body size in bytes
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum length of a batch entry id
pub const MAX_BATCH_ENTRY_ID_LENGTH: usize = 80;

/// Queue attribute names understood by the remote service
pub mod attributes {
    pub const QUEUE_ARN: &str = "QueueArn";
    pub const VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
    pub const RECEIVE_WAIT_TIME: &str = "ReceiveMessageWaitTimeSeconds";
    pub const APPROXIMATE_NUMBER_OF_MESSAGES: &str = "ApproximateNumberOfMessages";
    pub const APPROXIMATE_NUMBER_OF_MESSAGES_NOT_VISIBLE: &str =
        "ApproximateNumberOfMessagesNotVisible";
    pub const CREATED_TIMESTAMP: &str = "CreatedTimestamp";
    pub const REDRIVE_POLICY: &str = "RedrivePolicy";

    /// Message attribute carrying the reply queue name
    pub const REPLY_TO: &str = "ReplyTo";

    /// Message attribute carrying the JSON-encoded metadata map
    pub const META: &str = "Meta";
}

// ============================================================================
// Batch Types
// ============================================================================

/// One entry of a `SendMessageBatch` call
#[derive(Debug, Clone)]
pub struct SendMessageEntry {
    pub id: String,
    pub message: Message,
}

impl SendMessageEntry {
    pub fn new(message: Message) -> Self {
        Self {
            id: new_entry_id(),
            message,
        }
    }
}

/// One entry of a `DeleteMessageBatch` call
#[derive(Debug, Clone)]
pub struct DeleteMessageEntry {
    pub id: String,
    pub receipt_handle: ReceiptHandle,
}

impl DeleteMessageEntry {
    pub fn new(receipt_handle: ReceiptHandle) -> Self {
        Self {
            id: new_entry_id(),
            receipt_handle,
        }
    }
}

/// One entry of a `ChangeMessageVisibilityBatch` call
#[derive(Debug, Clone)]
pub struct ChangeVisibilityEntry {
    pub id: String,
    pub receipt_handle: ReceiptHandle,
    pub visibility_timeout: u32,
}

impl ChangeVisibilityEntry {
    pub fn new(receipt_handle: ReceiptHandle, visibility_timeout: u32) -> Self {
        Self {
            id: new_entry_id(),
            receipt_handle,
            visibility_timeout,
        }
    }
}

/// Successful entry of a batch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResultEntry {
    pub id: String,
    /// Only set for send batches
    pub message_id: Option<MessageId>,
}

/// Per-item outcome of a batch call the remote service accepted
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub successful: Vec<BatchResultEntry>,
    pub failed: Vec<BatchItemError>,
}

impl BatchResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> HashSet<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }

    pub fn succeeded(&self, id: &str) -> bool {
        self.successful.iter().any(|s| s.id == id)
    }
}

/// Parameters of a receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: u32,
    pub wait_time_seconds: u32,
    /// Overrides the queue's visibility timeout for this delivery
    pub visibility_timeout: Option<u32>,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time_seconds: 0,
            visibility_timeout: None,
        }
    }
}

impl ReceiveRequest {
    pub fn new(max_messages: u32) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_RECEIVE_MESSAGES),
            ..Default::default()
        }
    }

    pub fn with_wait_time(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = seconds.min(MAX_RECEIVE_WAIT_SECS);
        self
    }

    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(seconds.min(MAX_VISIBILITY_TIMEOUT_SECS));
        self
    }
}

fn new_entry_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Reject batches the remote service would refuse as a whole.
///
/// Checked before any remote call: the batch must contain 1 to
/// [`MAX_BATCH_SIZE`] entries whose ids are distinct, 1-80 characters long and
/// made of ASCII alphanumerics, hyphens and underscores.
pub fn validate_batch_ids<'a, I>(ids: I) -> Result<(), BatchConstraintViolation>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty()
            || id.len() > MAX_BATCH_ENTRY_ID_LENGTH
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BatchConstraintViolation::InvalidId { id: id.to_string() });
        }
        if !seen.insert(id) {
            return Err(BatchConstraintViolation::DuplicateId { id: id.to_string() });
        }
    }

    match seen.len() {
        0 => Err(BatchConstraintViolation::Empty),
        count if count > MAX_BATCH_SIZE => Err(BatchConstraintViolation::TooManyEntries {
            count,
            max: MAX_BATCH_SIZE,
        }),
        _ => Ok(()),
    }
}

// ============================================================================
// Remote Service Interface
// ============================================================================

/// Operations of the remote queuing service consumed by this crate
#[async_trait]
pub trait SqsClient: Send + Sync {
    /// Create a queue; fails with `QueueNameConflict` when it exists with
    /// different attributes, returns the existing URL when they match
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError>;

    /// Delete a queue and every message in it
    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError>;

    /// Remove all messages from a queue
    async fn purge_queue(&self, queue_url: &str) -> Result<(), QueueError>;

    /// Resolve a queue name to its URL
    async fn get_queue_url(&self, name: &QueueName) -> Result<String, QueueError>;

    /// Read all attributes of a queue
    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError>;

    /// Overwrite the given attributes of a queue
    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError>;

    /// List queue URLs, optionally restricted to a name prefix
    async fn list_queues(&self, prefix: Option<&str>) -> Result<Vec<String>, QueueError>;

    /// Send single message
    async fn send_message(
        &self,
        queue_url: &str,
        message: &Message,
    ) -> Result<MessageId, QueueError>;

    /// Send up to [`MAX_BATCH_SIZE`] messages
    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: &[SendMessageEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Receive up to `request.max_messages` messages, long-polling for
    /// `request.wait_time_seconds` when the queue is empty
    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Delete a received message
    async fn delete_message(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError>;

    /// Delete up to [`MAX_BATCH_SIZE`] received messages
    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: &[DeleteMessageEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Change how long a received message stays hidden
    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        visibility_timeout: u32,
    ) -> Result<(), QueueError>;

    /// Change visibility of up to [`MAX_BATCH_SIZE`] received messages
    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[ChangeVisibilityEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Factory for creating remote clients from configuration
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create a client for the configured provider
    pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn SqsClient>, QueueError> {
        match config {
            ProviderConfig::InMemory(in_memory) => Ok(Arc::new(InMemorySqs::new(in_memory.clone()))),
            ProviderConfig::AwsSqs(aws) => {
                let provider = AwsSqsProvider::new(aws.clone()).map_err(|e| e.to_queue_error())?;
                Ok(Arc::new(provider))
            }
        }
    }

    /// Create test client with in-memory provider
    pub fn create_test_client() -> Arc<dyn SqsClient> {
        Arc::new(InMemorySqs::default())
    }
}
