//! Message factory and the client handed to application code.
//!
//! A [`MessageFactory`] owns the queue manager, the buffer factory and strong
//! references to every buffer it has used, so buffered work lives exactly as
//! long as the factory. [`MessageQueueClient`]s are cheap clones sharing that
//! state.

use crate::buffer::{BufferErrorHandler, BufferFactory, MessageBuffer};
use crate::client::{QueueClientFactory, SqsClient, MAX_RECEIVE_WAIT_SECS};
use crate::config::MqSettings;
use crate::error::QueueError;
use crate::message::{Message, QueueName, QueueNames, ReceivedMessage};
use crate::queue_manager::{QueueCache, QueueManager, QueueOptions};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "mq_client_tests.rs"]
mod tests;

/// Pause between short polls when less than a second of wait time remains
const SHORT_POLL_PAUSE: Duration = Duration::from_millis(100);

struct FactoryShared {
    queue_manager: QueueManager,
    buffers: BufferFactory,
    names: QueueNames,
    owned: DashMap<QueueName, Arc<MessageBuffer>>,
}

impl Drop for FactoryShared {
    fn drop(&mut self) {
        let pending: Vec<Arc<MessageBuffer>> = self
            .owned
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|buffer| !buffer.is_disposed() && buffer.has_pending())
            .collect();
        if pending.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    buffers = pending.len(),
                    "Message factory dropped without dispose; flushing in the background"
                );
                handle.spawn(async move {
                    for buffer in pending {
                        if let Err(e) = buffer.dispose().await {
                            warn!(queue = %buffer.queue_name(), error = %e, "Background flush failed");
                        }
                    }
                });
            }
            Err(_) => error!(
                buffers = pending.len(),
                "Message factory dropped outside a runtime; buffered operations are lost"
            ),
        }
    }
}

/// Builds message clients over one queue manager and buffer factory.
///
/// Call [`MessageFactory::dispose`] before dropping the last handle. Dropping
/// it with buffered work only gets a best-effort background flush.
#[derive(Clone)]
pub struct MessageFactory {
    shared: Arc<FactoryShared>,
}

impl MessageFactory {
    pub fn new(queue_manager: QueueManager, buffers: BufferFactory, names: QueueNames) -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                queue_manager,
                buffers,
                names,
                owned: DashMap::new(),
            }),
        }
    }

    /// Factory over an existing remote client, configured from `settings`
    pub fn with_client(
        client: Arc<dyn SqsClient>,
        settings: &MqSettings,
        error_handler: Option<BufferErrorHandler>,
    ) -> Self {
        let queue_manager = QueueManager::with_cache(
            Arc::clone(&client),
            QueueCache::new(),
            settings.queues.clone(),
        );
        let buffers = BufferFactory::new(client, error_handler, settings.buffer.flush_interval());
        Self::new(
            queue_manager,
            buffers,
            QueueNames::new(settings.queue_prefix.clone()),
        )
    }

    /// Factory talking to the provider named in `settings`
    pub fn from_settings(settings: &MqSettings) -> Result<Self, QueueError> {
        let client = QueueClientFactory::create_client(&settings.provider)?;
        Ok(Self::with_client(client, settings, None))
    }

    pub fn create_client(&self) -> MessageQueueClient {
        MessageQueueClient {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.shared.queue_manager
    }

    pub fn buffer_factory(&self) -> &BufferFactory {
        &self.shared.buffers
    }

    pub fn names(&self) -> &QueueNames {
        &self.shared.names
    }

    /// Flush every buffer now
    pub async fn flush(&self) {
        self.shared.buffers.flush_all().await;
    }

    /// Make look-ahead messages cached for `queue` visible to other
    /// consumers again
    pub async fn release_cached_messages(&self, queue: &QueueName) {
        let buffer = self
            .shared
            .owned
            .get(queue)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(buffer) = buffer {
            buffer.release_cached_messages().await;
        }
    }

    /// Flush and dispose every buffer and stop the flush timer
    pub async fn dispose(&self) -> Result<(), QueueError> {
        let result = self.shared.buffers.dispose().await;
        self.shared.owned.clear();
        info!("Disposed message factory");
        result
    }
}

/// Publishes, receives and acknowledges messages through per-queue buffers
#[derive(Clone)]
pub struct MessageQueueClient {
    shared: Arc<FactoryShared>,
}

impl MessageQueueClient {
    pub fn names(&self) -> &QueueNames {
        &self.shared.names
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.shared.queue_manager
    }

    /// Fresh temporary queue name for a request/reply exchange
    pub fn temp_queue_name(&self) -> QueueName {
        self.shared.names.temp_queue()
    }

    /// Publish to the inbound queue of `message_type`; returns whether the
    /// message was sent during this call rather than buffered
    pub async fn publish(&self, message_type: &str, message: Message) -> Result<bool, QueueError> {
        let queue = self.shared.names.in_queue(message_type)?;
        self.publish_to(&queue, message).await
    }

    /// Publish to any queue, creating it with defaults when needed.
    ///
    /// Temporary queues are sent to immediately.
    pub async fn publish_to(&self, queue: &QueueName, message: Message) -> Result<bool, QueueError> {
        if queue.is_temporary() {
            self.send_now(queue, &message).await?;
            return Ok(true);
        }

        let buffer = self.buffer_for(queue).await?;
        let result = buffer.send(message.clone()).await;
        match result {
            Err(e) if e.is_not_found() => {
                debug!(queue = %queue, "Queue vanished; recreating before publishing");
                // Released first so the registry cannot hand the stale buffer back.
                drop(buffer);
                self.forget(queue);
                self.buffer_for(queue).await?.send(message).await
            }
            other => other,
        }
    }

    /// Receive one message, waiting up to `timeout`; `Ok(None)` when nothing
    /// arrived in time
    ///
    /// # Example
    ///
    /// ```rust
    /// use sqs_mq::{InMemorySqs, Message, MessageFactory, MqSettings, QueueName};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # tokio_test::block_on(async {
    /// let factory =
    ///     MessageFactory::with_client(Arc::new(InMemorySqs::default()), &MqSettings::default(), None);
    /// let client = factory.create_client();
    /// let queue = QueueName::new("greetings").unwrap();
    ///
    /// client.publish_to(&queue, Message::new("hello")).await.unwrap();
    /// factory.flush().await;
    ///
    /// let message = client.get(&queue, Duration::from_secs(1)).await.unwrap().unwrap();
    /// assert_eq!(message.body_str(), Some("hello"));
    /// client.ack(&message).await.unwrap();
    /// factory.dispose().await.unwrap();
    /// # });
    /// ```
    pub async fn get(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let buffer = self.buffer_for(queue).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.as_secs().min(u64::from(MAX_RECEIVE_WAIT_SECS)) as u32;

            if let Some(message) = buffer.receive(wait).await? {
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if wait == 0 {
                tokio::time::sleep(remaining.min(SHORT_POLL_PAUSE)).await;
            }
        }
    }

    /// Delete a processed message; returns whether the delete was sent during
    /// this call rather than buffered
    pub async fn ack(&self, message: &ReceivedMessage) -> Result<bool, QueueError> {
        let buffer = self.buffer_for_message(message).await?;
        buffer.delete(message.receipt_handle.clone()).await
    }

    /// Reject a message: make it visible again, or move it to the dead-letter
    /// queue belonging to its queue
    pub async fn nak(&self, message: &ReceivedMessage, requeue: bool) -> Result<bool, QueueError> {
        if requeue {
            return self.change_visibility(message, 0).await;
        }

        let source = QueueName::from_queue_url(&message.queue_url)?;
        let dead_letter = dead_letter_queue_for(&source)?;
        self.send_now(&dead_letter, &message.message()).await?;
        warn!(
            queue = %source,
            dead_letter_queue = %dead_letter,
            message_id = %message.message_id,
            receive_count = message.receive_count,
            "Moved message to dead-letter queue"
        );

        let buffer = self.buffer_for(&source).await?;
        buffer.delete(message.receipt_handle.clone()).await
    }

    pub async fn change_visibility(
        &self,
        message: &ReceivedMessage,
        visibility_timeout: u32,
    ) -> Result<bool, QueueError> {
        let buffer = self.buffer_for_message(message).await?;
        buffer
            .change_visibility(message.receipt_handle.clone(), visibility_timeout)
            .await
    }

    /// Send `message` to `message_type` and wait up to `timeout` for the
    /// handler's reply on a fresh temporary queue.
    ///
    /// The temporary queue is left for the empty-temporary-queue sweep.
    pub async fn request(
        &self,
        message_type: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<ReceivedMessage, QueueError> {
        let reply_queue = self.temp_queue_name();
        let manager = &self.shared.queue_manager;
        manager
            .create_queue(
                &reply_queue,
                &QueueOptions::default().with_disable_buffering(true),
            )
            .await?;

        let inbound = self.shared.names.in_queue(message_type)?;
        self.send_now(&inbound, &message.with_reply_to(reply_queue.clone()))
            .await?;
        debug!(message_type = %message_type, reply_queue = %reply_queue, "Sent request");

        let reply = self.get(&reply_queue, timeout).await;
        if let Some((_, buffer)) = self.shared.owned.remove(&reply_queue) {
            // Only ever used unbuffered, so disposing sends nothing.
            let _ = buffer.dispose().await;
        }

        match reply? {
            Some(reply) => {
                manager
                    .client()
                    .delete_message(&reply.queue_url, &reply.receipt_handle)
                    .await?;
                Ok(reply)
            }
            None => Err(QueueError::Timeout { duration: timeout }),
        }
    }

    async fn send_now(&self, queue: &QueueName, message: &Message) -> Result<(), QueueError> {
        let manager = &self.shared.queue_manager;
        let definition = manager.get_or_create(queue).await?;
        match manager.client().send_message(&definition.queue_url, message).await {
            Err(e) if e.is_not_found() => {
                manager.evict(queue);
                let definition = manager.get_or_create(queue).await?;
                manager
                    .client()
                    .send_message(&definition.queue_url, message)
                    .await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn buffer_for_message(
        &self,
        message: &ReceivedMessage,
    ) -> Result<Arc<MessageBuffer>, QueueError> {
        let queue = QueueName::from_queue_url(&message.queue_url)?;
        self.buffer_for(&queue).await
    }

    async fn buffer_for(&self, queue: &QueueName) -> Result<Arc<MessageBuffer>, QueueError> {
        let existing = self
            .shared
            .owned
            .get(queue)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(buffer) = existing {
            if !buffer.is_disposed() {
                return Ok(buffer);
            }
        }

        let definition = self.shared.queue_manager.get_or_create(queue).await?;
        let buffer = self.shared.buffers.get_or_create_buffer(definition);
        self.shared
            .owned
            .insert(queue.clone(), Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Drop the cached definition and buffer of a queue that no longer exists
    fn forget(&self, queue: &QueueName) {
        self.shared.queue_manager.evict(queue);
        self.shared.owned.remove(queue);
    }
}

/// `mq-Order-inq` pairs with `mq-Order-dlq`; any other queue gets a `-dlq`
/// suffix
fn dead_letter_queue_for(queue: &QueueName) -> Result<QueueName, QueueError> {
    let name = queue.as_str();
    let dead_letter = match name.strip_suffix("-inq") {
        Some(stem) => format!("{}-dlq", stem),
        None => format!("{}-dlq", name),
    };
    Ok(QueueName::new(dead_letter)?)
}
