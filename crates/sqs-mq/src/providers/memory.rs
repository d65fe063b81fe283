//! In-memory queue service implementation for testing and development.
//!
//! This module provides a fully functional in-memory emulation of the remote
//! queuing service that:
//! - Assigns queue URLs and ARNs and stores queue attributes
//! - Implements visibility timeouts; receipt handles die with their delivery
//! - Tracks `ApproximateReceiveCount` and applies redrive policies
//! - Supports long polling and per-item batch failures
//! - Can delay queue listing to model eventual consistency
//!
//! This provider is intended for:
//! - Unit and integration testing of queue consumers
//! - Development and prototyping

use crate::client::{
    attributes, validate_batch_ids, BatchResult, BatchResultEntry, ChangeVisibilityEntry,
    DeleteMessageEntry, ReceiveRequest, SendMessageEntry, SqsClient, MAX_MESSAGE_SIZE,
    MAX_RECEIVE_WAIT_SECS, MAX_VISIBILITY_TIMEOUT_SECS,
};
use crate::error::{BatchItemError, QueueError, ValidationError};
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::{InMemoryConfig, ProviderType};
use crate::queue_manager::RedrivePolicy;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Longest a long-polling receive sleeps before re-checking visibility expiries
const POLL_SLICE: Duration = Duration::from_millis(50);

const DEFAULT_VISIBILITY_TIMEOUT: &str = "30";
const DEFAULT_RECEIVE_WAIT_TIME: &str = "0";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
        }
    }

    fn queue_url(&self, name: &QueueName) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.account_id,
            name
        )
    }

    fn queue_arn(&self, name: &QueueName) -> String {
        format!(
            "arn:aws:sqs:{}:{}:{}",
            self.config.region, self.config.account_id, name
        )
    }

    fn queue_mut(&mut self, queue_url: &str) -> Result<&mut InMemoryQueue, QueueError> {
        let not_found = || QueueError::QueueNotFound {
            queue_name: queue_url.to_string(),
        };
        let name = QueueName::from_queue_url(queue_url).map_err(|_| not_found())?;
        match self.queues.get_mut(&name) {
            Some(queue) if queue.url == queue_url => Ok(queue),
            _ => Err(not_found()),
        }
    }

    fn queue_by_arn_mut(&mut self, arn: &str) -> Option<&mut InMemoryQueue> {
        self.queues.values_mut().find(|q| q.arn == arn)
    }
}

/// Internal queue state for a single queue
struct InMemoryQueue {
    url: String,
    arn: String,
    /// User-settable attributes (visibility timeout, wait time, redrive policy)
    attributes: HashMap<String, String>,
    created_at: Timestamp,
    created_instant: Instant,
    /// Visible messages (best-effort FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Delivered messages keyed by their current receipt handle
    in_flight: HashMap<String, InFlightMessage>,
}

impl InMemoryQueue {
    fn visibility_timeout(&self) -> u32 {
        self.attributes
            .get(attributes::VISIBILITY_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(30)
    }

    fn redrive_policy(&self) -> Option<RedrivePolicy> {
        self.attributes
            .get(attributes::REDRIVE_POLICY)
            .and_then(|json| RedrivePolicy::from_json(json).ok())
    }

    /// Return deliveries whose visibility timeout elapsed to the visible set.
    /// Their receipt handles stop being valid.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(in_flight) = self.in_flight.remove(&receipt) {
                self.messages.push_back(in_flight.message);
            }
        }
    }

    fn all_attributes(&self) -> HashMap<String, String> {
        let mut all = self.attributes.clone();
        all.insert(attributes::QUEUE_ARN.to_string(), self.arn.clone());
        all.insert(
            attributes::APPROXIMATE_NUMBER_OF_MESSAGES.to_string(),
            self.messages.len().to_string(),
        );
        all.insert(
            attributes::APPROXIMATE_NUMBER_OF_MESSAGES_NOT_VISIBLE.to_string(),
            self.in_flight.len().to_string(),
        );
        all.insert(
            attributes::CREATED_TIMESTAMP.to_string(),
            self.created_at.epoch_seconds().to_string(),
        );
        all
    }
}

/// A message stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    message: Message,
    sent_at: Timestamp,
    receive_count: u32,
}

impl StoredMessage {
    fn new(message: &Message) -> Self {
        Self {
            message_id: MessageId::new(),
            message: message.clone(),
            sent_at: Timestamp::now(),
            receive_count: 0,
        }
    }

    fn to_received(&self, queue_url: &str, receipt: &str) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            queue_url: queue_url.to_string(),
            receipt_handle: ReceiptHandle::new(receipt),
            body: self.message.body.clone(),
            attributes: self.message.attributes.clone(),
            reply_to: self.message.reply_to.clone(),
            meta: self.message.meta.clone(),
            receive_count: self.receive_count,
            sent_at: self.sent_at.clone(),
        }
    }
}

/// A message currently hidden after delivery
struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

/// Validate and canonicalize user-supplied queue attributes
fn normalize_attributes(
    attributes: &HashMap<String, String>,
) -> Result<HashMap<String, String>, QueueError> {
    let mut normalized = HashMap::with_capacity(attributes.len());
    for (key, value) in attributes {
        let value = match key.as_str() {
            attributes::VISIBILITY_TIMEOUT => {
                parse_bounded(key, value, MAX_VISIBILITY_TIMEOUT_SECS)?.to_string()
            }
            attributes::RECEIVE_WAIT_TIME => {
                parse_bounded(key, value, MAX_RECEIVE_WAIT_SECS)?.to_string()
            }
            attributes::REDRIVE_POLICY if value.is_empty() => String::new(),
            attributes::REDRIVE_POLICY => RedrivePolicy::from_json(value)?.to_json()?,
            _ => value.clone(),
        };
        normalized.insert(key.clone(), value);
    }
    Ok(normalized)
}

fn parse_bounded(key: &str, value: &str, max: u32) -> Result<u32, QueueError> {
    let parsed: u32 = value.parse().map_err(|_| ValidationError::InvalidFormat {
        field: key.to_string(),
        message: format!("'{}' is not a whole number of seconds", value),
    })?;
    if parsed > max {
        return Err(ValidationError::OutOfRange {
            field: key.to_string(),
            message: format!("{} exceeds the maximum of {}", parsed, max),
        }
        .into());
    }
    Ok(parsed)
}

// ============================================================================
// InMemorySqs
// ============================================================================

/// In-memory implementation of the remote queuing service
pub struct InMemorySqs {
    storage: Arc<RwLock<QueueStorage>>,
    message_arrived: Arc<Notify>,
}

impl InMemorySqs {
    /// Create new in-memory service with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new(config))),
            message_arrived: Arc::new(Notify::new()),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, QueueStorage>, QueueError> {
        self.storage.write().map_err(|_| poisoned())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, QueueStorage>, QueueError> {
        self.storage.read().map_err(|_| poisoned())
    }

    fn push_message(&self, queue_url: &str, message: &Message) -> Result<MessageId, QueueError> {
        if message.body.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: message.body.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        let mut storage = self.write()?;
        let max_queue_size = storage.config.max_queue_size;
        let queue = storage.queue_mut(queue_url)?;
        if queue.messages.len() + queue.in_flight.len() >= max_queue_size {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.name().to_string(),
                code: "QueueFull".to_string(),
                message: format!("queue holds {} messages", max_queue_size),
            });
        }

        let stored = StoredMessage::new(message);
        let message_id = stored.message_id.clone();
        queue.messages.push_back(stored);
        Ok(message_id)
    }

    /// Non-blocking receive: deliver what is visible right now
    fn try_receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now = Instant::now();
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        queue.reclaim_expired(now);

        let visibility = request
            .visibility_timeout
            .unwrap_or_else(|| queue.visibility_timeout())
            .min(MAX_VISIBILITY_TIMEOUT_SECS);
        let redrive = queue.redrive_policy();
        let max = request.max_messages.clamp(1, 10) as usize;

        let mut delivered = Vec::new();
        let mut dead = Vec::new();
        while delivered.len() < max {
            let Some(mut stored) = queue.messages.pop_front() else {
                break;
            };

            if let Some(policy) = &redrive {
                if stored.receive_count >= policy.max_receive_count {
                    dead.push(stored);
                    continue;
                }
            }

            stored.receive_count += 1;
            let receipt = uuid::Uuid::new_v4().simple().to_string();
            delivered.push(stored.to_received(queue_url, &receipt));
            queue.in_flight.insert(
                receipt,
                InFlightMessage {
                    message: stored,
                    visible_at: now + Duration::from_secs(u64::from(visibility)),
                },
            );
        }

        if let (Some(policy), false) = (redrive, dead.is_empty()) {
            let count = dead.len();
            match storage.queue_by_arn_mut(&policy.dead_letter_target_arn) {
                Some(dlq) => {
                    for mut stored in dead {
                        stored.receive_count = 0;
                        dlq.messages.push_back(stored);
                    }
                    debug!(
                        queue_url = %queue_url,
                        dead_letter_arn = %policy.dead_letter_target_arn,
                        count = count,
                        "Moved messages to dead-letter queue"
                    );
                }
                None => {
                    // Dead-letter target missing: keep the messages where they were.
                    let queue = storage.queue_mut(queue_url)?;
                    queue.messages.extend(dead);
                }
            }
            self.message_arrived.notify_waiters();
        }

        Ok(delivered)
    }

    fn delete_one(&self, queue_url: &str, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        queue.reclaim_expired(Instant::now());
        match queue.in_flight.remove(receipt.as_str()) {
            Some(_) => Ok(()),
            None => Err(QueueError::InvalidReceiptHandle {
                receipt: receipt.to_string(),
            }),
        }
    }

    fn change_visibility_one(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        visibility_timeout: u32,
    ) -> Result<(), QueueError> {
        if visibility_timeout > MAX_VISIBILITY_TIMEOUT_SECS {
            return Err(ValidationError::OutOfRange {
                field: attributes::VISIBILITY_TIMEOUT.to_string(),
                message: format!("{} exceeds the maximum", visibility_timeout),
            }
            .into());
        }

        let now = Instant::now();
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        queue.reclaim_expired(now);

        if visibility_timeout == 0 {
            let in_flight = queue.in_flight.remove(receipt.as_str()).ok_or_else(|| {
                QueueError::InvalidReceiptHandle {
                    receipt: receipt.to_string(),
                }
            })?;
            queue.messages.push_back(in_flight.message);
            drop(storage);
            self.message_arrived.notify_waiters();
            return Ok(());
        }

        match queue.in_flight.get_mut(receipt.as_str()) {
            Some(in_flight) => {
                in_flight.visible_at = now + Duration::from_secs(u64::from(visibility_timeout));
                Ok(())
            }
            None => Err(QueueError::InvalidReceiptHandle {
                receipt: receipt.to_string(),
            }),
        }
    }

    /// Ensure the queue exists before per-item processing of a batch
    fn ensure_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        storage.queue_mut(queue_url).map(|_| ())
    }
}

fn poisoned() -> QueueError {
    QueueError::ProviderError {
        provider: ProviderType::InMemory.name().to_string(),
        code: "StoragePoisoned".to_string(),
        message: "in-memory storage lock poisoned".to_string(),
    }
}

fn item_error(id: &str, error: &QueueError) -> BatchItemError {
    BatchItemError::from_queue_error(id, error)
}

impl Default for InMemorySqs {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl SqsClient for InMemorySqs {
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        let requested = normalize_attributes(attributes)?;
        let mut storage = self.write()?;

        if let Some(existing) = storage.queues.get(name) {
            let conflicting: Vec<&String> = requested
                .iter()
                .filter(|(key, value)| {
                    existing.attributes.get(*key).map(String::as_str).unwrap_or("")
                        != value.as_str()
                })
                .map(|(key, _)| key)
                .collect();

            if !conflicting.is_empty() {
                return Err(QueueError::QueueNameConflict {
                    queue_name: name.to_string(),
                    message: format!("attributes differ: {:?}", conflicting),
                });
            }
            return Ok(existing.url.clone());
        }

        let mut stored_attributes = HashMap::from([
            (
                attributes::VISIBILITY_TIMEOUT.to_string(),
                DEFAULT_VISIBILITY_TIMEOUT.to_string(),
            ),
            (
                attributes::RECEIVE_WAIT_TIME.to_string(),
                DEFAULT_RECEIVE_WAIT_TIME.to_string(),
            ),
        ]);
        stored_attributes.extend(requested.into_iter().filter(|(_, v)| !v.is_empty()));

        let url = storage.queue_url(name);
        let arn = storage.queue_arn(name);
        storage.queues.insert(
            name.clone(),
            InMemoryQueue {
                url: url.clone(),
                arn,
                attributes: stored_attributes,
                created_at: Timestamp::now(),
                created_instant: Instant::now(),
                messages: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );

        debug!(queue = %name, queue_url = %url, "Created in-memory queue");
        Ok(url)
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        storage.queue_mut(queue_url)?;
        let name = QueueName::from_queue_url(queue_url)?;
        storage.queues.remove(&name);
        debug!(queue = %name, "Deleted in-memory queue");
        Ok(())
    }

    async fn purge_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        queue.messages.clear();
        queue.in_flight.clear();
        Ok(())
    }

    async fn get_queue_url(&self, name: &QueueName) -> Result<String, QueueError> {
        let storage = self.read()?;
        storage
            .queues
            .get(name)
            .map(|q| q.url.clone())
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: name.to_string(),
            })
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError> {
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        queue.reclaim_expired(Instant::now());
        Ok(queue.all_attributes())
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let normalized = normalize_attributes(attributes)?;
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;
        for (key, value) in normalized {
            if value.is_empty() {
                queue.attributes.remove(&key);
            } else {
                queue.attributes.insert(key, value);
            }
        }
        Ok(())
    }

    async fn list_queues(&self, prefix: Option<&str>) -> Result<Vec<String>, QueueError> {
        let storage = self.read()?;
        let delay = Duration::from_millis(storage.config.list_visibility_delay_ms);
        let mut urls: Vec<String> = storage
            .queues
            .iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.as_str().starts_with(p)))
            .filter(|(_, queue)| queue.created_instant.elapsed() >= delay)
            .map(|(_, queue)| queue.url.clone())
            .collect();
        urls.sort();
        Ok(urls)
    }

    async fn send_message(
        &self,
        queue_url: &str,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        let message_id = self.push_message(queue_url, message)?;
        self.message_arrived.notify_waiters();
        Ok(message_id)
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: &[SendMessageEntry],
    ) -> Result<BatchResult, QueueError> {
        validate_batch_ids(entries.iter().map(|e| e.id.as_str()))?;
        self.ensure_queue(queue_url)?;

        let mut result = BatchResult::default();
        for entry in entries {
            match self.push_message(queue_url, &entry.message) {
                Ok(message_id) => result.successful.push(BatchResultEntry {
                    id: entry.id.clone(),
                    message_id: Some(message_id),
                }),
                Err(QueueError::QueueNotFound { queue_name }) => {
                    return Err(QueueError::QueueNotFound { queue_name })
                }
                Err(e) => result.failed.push(item_error(&entry.id, &e)),
            }
        }

        if !result.successful.is_empty() {
            self.message_arrived.notify_waiters();
        }
        Ok(result)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let wait = Duration::from_secs(u64::from(
            request.wait_time_seconds.min(MAX_RECEIVE_WAIT_SECS),
        ));
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.message_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.try_receive(queue_url, request)?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }

            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        self.delete_one(queue_url, receipt)
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: &[DeleteMessageEntry],
    ) -> Result<BatchResult, QueueError> {
        validate_batch_ids(entries.iter().map(|e| e.id.as_str()))?;
        self.ensure_queue(queue_url)?;

        let mut result = BatchResult::default();
        for entry in entries {
            match self.delete_one(queue_url, &entry.receipt_handle) {
                Ok(()) => result.successful.push(BatchResultEntry {
                    id: entry.id.clone(),
                    message_id: None,
                }),
                Err(QueueError::QueueNotFound { queue_name }) => {
                    return Err(QueueError::QueueNotFound { queue_name })
                }
                Err(e) => result.failed.push(item_error(&entry.id, &e)),
            }
        }
        Ok(result)
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        visibility_timeout: u32,
    ) -> Result<(), QueueError> {
        self.change_visibility_one(queue_url, receipt, visibility_timeout)
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[ChangeVisibilityEntry],
    ) -> Result<BatchResult, QueueError> {
        validate_batch_ids(entries.iter().map(|e| e.id.as_str()))?;
        self.ensure_queue(queue_url)?;

        let mut result = BatchResult::default();
        for entry in entries {
            match self.change_visibility_one(
                queue_url,
                &entry.receipt_handle,
                entry.visibility_timeout,
            ) {
                Ok(()) => result.successful.push(BatchResultEntry {
                    id: entry.id.clone(),
                    message_id: None,
                }),
                Err(QueueError::QueueNotFound { queue_name }) => {
                    return Err(QueueError::QueueNotFound { queue_name })
                }
                Err(e) => result.failed.push(item_error(&entry.id, &e)),
            }
        }
        Ok(result)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
