//! Common test utilities for sqs-mq integration tests
//!
//! This module provides:
//! - A recording remote client that counts calls per operation
//! - Settings and factory builders tuned for fast tests
//! - Polling helpers for asynchronous assertions

use async_trait::async_trait;
use sqs_mq::client::{ChangeVisibilityEntry, DeleteMessageEntry, SendMessageEntry};
use sqs_mq::{
    BatchResult, BufferErrorHandler, BufferedOperationError, InMemorySqs, Message, MessageFactory,
    MessageId, MqSettings, ProviderType, QueueError, QueueName, ReceiptHandle, ReceiveRequest,
    ReceivedMessage, SqsClient,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Recording Client
// ============================================================================

/// In-memory remote service that counts every call by operation name
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingSqs {
    inner: InMemorySqs,
    calls: Mutex<HashMap<&'static str, usize>>,
}

#[allow(dead_code)]
impl RecordingSqs {
    pub fn new(inner: InMemorySqs) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, operation: &'static str) {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
    }
}

#[async_trait]
impl SqsClient for RecordingSqs {
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        self.record("create_queue");
        self.inner.create_queue(name, attributes).await
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.record("delete_queue");
        self.inner.delete_queue(queue_url).await
    }

    async fn purge_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.record("purge_queue");
        self.inner.purge_queue(queue_url).await
    }

    async fn get_queue_url(&self, name: &QueueName) -> Result<String, QueueError> {
        self.record("get_queue_url");
        self.inner.get_queue_url(name).await
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError> {
        self.record("get_queue_attributes");
        self.inner.get_queue_attributes(queue_url).await
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        self.record("set_queue_attributes");
        self.inner.set_queue_attributes(queue_url, attributes).await
    }

    async fn list_queues(&self, prefix: Option<&str>) -> Result<Vec<String>, QueueError> {
        self.record("list_queues");
        self.inner.list_queues(prefix).await
    }

    async fn send_message(
        &self,
        queue_url: &str,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        self.record("send_message");
        self.inner.send_message(queue_url, message).await
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: &[SendMessageEntry],
    ) -> Result<BatchResult, QueueError> {
        self.record("send_message_batch");
        self.inner.send_message_batch(queue_url, entries).await
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.record("receive_messages");
        self.inner.receive_messages(queue_url, request).await
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        self.record("delete_message");
        self.inner.delete_message(queue_url, receipt).await
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: &[DeleteMessageEntry],
    ) -> Result<BatchResult, QueueError> {
        self.record("delete_message_batch");
        self.inner.delete_message_batch(queue_url, entries).await
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        visibility_timeout: u32,
    ) -> Result<(), QueueError> {
        self.record("change_message_visibility");
        self.inner
            .change_message_visibility(queue_url, receipt, visibility_timeout)
            .await
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[ChangeVisibilityEntry],
    ) -> Result<BatchResult, QueueError> {
        self.record("change_message_visibility_batch");
        self.inner
            .change_message_visibility_batch(queue_url, entries)
            .await
    }

    fn provider_type(&self) -> ProviderType {
        self.inner.provider_type()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Settings with a short flush interval and one-second worker polls
#[allow(dead_code)]
pub fn fast_settings() -> MqSettings {
    let mut settings = MqSettings::default();
    settings.buffer.flush_interval_ms = 20;
    settings.server.worker_wait_seconds = 1;
    settings
}

/// Collects every buffered operation the remote service rejected
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct FailureLog {
    failures: Arc<Mutex<Vec<BufferedOperationError>>>,
}

#[allow(dead_code)]
impl FailureLog {
    pub fn handler(&self) -> BufferErrorHandler {
        let failures = Arc::clone(&self.failures);
        Arc::new(move |error: &BufferedOperationError| {
            failures.lock().unwrap().push(error.clone());
        })
    }

    pub fn failures(&self) -> Vec<BufferedOperationError> {
        self.failures.lock().unwrap().clone()
    }
}

/// Factory over a fresh recording in-memory service
#[allow(dead_code)]
pub fn recording_factory(
    settings: &MqSettings,
    error_handler: Option<BufferErrorHandler>,
) -> (MessageFactory, Arc<RecordingSqs>) {
    let remote = Arc::new(RecordingSqs::default());
    let factory = MessageFactory::with_client(remote.clone(), settings, error_handler);
    (factory, remote)
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` until it holds or `timeout` passes
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Install a test log subscriber once; honours `RUST_LOG`
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
