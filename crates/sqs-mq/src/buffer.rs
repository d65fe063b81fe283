//! Client-side batching of queue operations.
//!
//! A [`MessageBuffer`] collects sends, deletes and visibility changes for one
//! queue and submits them in batches of at most [`MAX_BATCH_SIZE`] entries.
//! Pending work is flushed when a list reaches its threshold, on every tick of
//! the shared timer owned by the [`BufferFactory`], or when the buffer is
//! disposed. Items the remote service rejects inside an accepted batch are
//! reported one by one through the buffer's error handler and never retried
//! here.
//!
//! Receives go the other way: one remote call fetches up to the receive
//! threshold and the surplus is served to later callers from a look-ahead
//! cache.

use crate::client::{
    ChangeVisibilityEntry, DeleteMessageEntry, ReceiveRequest, SendMessageEntry, SqsClient,
    BatchResult, MAX_BATCH_SIZE,
};
use crate::error::{BatchItemError, QueueError};
use crate::message::{Message, QueueName, ReceiptHandle, ReceivedMessage};
use crate::queue_manager::QueueDefinition;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;

// ============================================================================
// Error Reporting
// ============================================================================

/// Kind of buffered operation an item belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferedOperation {
    Send,
    Delete,
    ChangeVisibility,
}

impl fmt::Display for BufferedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Delete => write!(f, "delete"),
            Self::ChangeVisibility => write!(f, "change-visibility"),
        }
    }
}

/// One buffered item the remote service did not accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedOperationError {
    pub queue_name: QueueName,
    pub operation: BufferedOperation,
    pub error: BatchItemError,
}

impl fmt::Display for BufferedOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffered {} on queue '{}' failed: {}",
            self.operation, self.queue_name, self.error
        )
    }
}

/// Callback receiving per-item failures of buffered operations
pub type BufferErrorHandler = Arc<dyn Fn(&BufferedOperationError) + Send + Sync>;

// ============================================================================
// Batch Entries
// ============================================================================

/// A pending entry that can be submitted in a batch call
#[async_trait]
trait BatchEntry: Clone + Send + Sync + 'static {
    const OPERATION: BufferedOperation;

    fn id(&self) -> &str;

    async fn submit(
        client: &dyn SqsClient,
        queue_url: &str,
        chunk: &[Self],
    ) -> Result<BatchResult, QueueError>;
}

#[async_trait]
impl BatchEntry for SendMessageEntry {
    const OPERATION: BufferedOperation = BufferedOperation::Send;

    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(
        client: &dyn SqsClient,
        queue_url: &str,
        chunk: &[Self],
    ) -> Result<BatchResult, QueueError> {
        client.send_message_batch(queue_url, chunk).await
    }
}

#[async_trait]
impl BatchEntry for DeleteMessageEntry {
    const OPERATION: BufferedOperation = BufferedOperation::Delete;

    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(
        client: &dyn SqsClient,
        queue_url: &str,
        chunk: &[Self],
    ) -> Result<BatchResult, QueueError> {
        client.delete_message_batch(queue_url, chunk).await
    }
}

#[async_trait]
impl BatchEntry for ChangeVisibilityEntry {
    const OPERATION: BufferedOperation = BufferedOperation::ChangeVisibility;

    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(
        client: &dyn SqsClient,
        queue_url: &str,
        chunk: &[Self],
    ) -> Result<BatchResult, QueueError> {
        client.change_message_visibility_batch(queue_url, chunk).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Message Buffer
// ============================================================================

/// Per-queue batching of send, delete, change-visibility and receive
pub struct MessageBuffer {
    definition: Arc<QueueDefinition>,
    client: Arc<dyn SqsClient>,
    error_handler: Option<BufferErrorHandler>,
    pending_sends: Mutex<Vec<SendMessageEntry>>,
    pending_deletes: Mutex<Vec<DeleteMessageEntry>>,
    pending_visibility: Mutex<Vec<ChangeVisibilityEntry>>,
    received: Mutex<VecDeque<ReceivedMessage>>,
    /// Serializes timer and dispose flushes
    flush_gate: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl MessageBuffer {
    pub fn new(
        definition: Arc<QueueDefinition>,
        client: Arc<dyn SqsClient>,
        error_handler: Option<BufferErrorHandler>,
    ) -> Self {
        Self {
            definition,
            client,
            error_handler,
            pending_sends: Mutex::new(Vec::new()),
            pending_deletes: Mutex::new(Vec::new()),
            pending_visibility: Mutex::new(Vec::new()),
            received: Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn definition(&self) -> &Arc<QueueDefinition> {
        &self.definition
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.definition.queue_name
    }

    pub fn queue_url(&self) -> &str {
        &self.definition.queue_url
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn pending_send_count(&self) -> usize {
        lock(&self.pending_sends).len()
    }

    pub fn pending_delete_count(&self) -> usize {
        lock(&self.pending_deletes).len()
    }

    pub fn pending_change_visibility_count(&self) -> usize {
        lock(&self.pending_visibility).len()
    }

    pub fn cached_receive_count(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_send_count() > 0
            || self.pending_delete_count() > 0
            || self.pending_change_visibility_count() > 0
    }

    /// Send a message.
    ///
    /// Returns `Ok(true)` when the message reached the remote service during
    /// this call and `Ok(false)` when it was only buffered. Failures of other
    /// items flushed by this call go to the error handler.
    pub async fn send(&self, message: Message) -> Result<bool, QueueError> {
        let settings = &self.definition.buffering;
        let threshold = settings.send_buffer_size();
        if settings.is_buffering_disabled() || threshold <= 1 {
            self.ensure_active("send")?;
            self.client
                .send_message(self.queue_url(), &message)
                .await?;
            return Ok(true);
        }

        self.enqueue(&self.pending_sends, SendMessageEntry::new(message), threshold, "send")
            .await
    }

    /// Delete a received message; same return contract as [`send`](Self::send)
    pub async fn delete(&self, receipt: ReceiptHandle) -> Result<bool, QueueError> {
        let settings = &self.definition.buffering;
        let threshold = settings.delete_buffer_size();
        if settings.is_buffering_disabled() || threshold <= 1 {
            self.ensure_active("delete")?;
            self.client.delete_message(self.queue_url(), &receipt).await?;
            return Ok(true);
        }

        self.enqueue(
            &self.pending_deletes,
            DeleteMessageEntry::new(receipt),
            threshold,
            "delete",
        )
        .await
    }

    /// Change the visibility timeout of a received message; same return
    /// contract as [`send`](Self::send)
    pub async fn change_visibility(
        &self,
        receipt: ReceiptHandle,
        visibility_timeout: u32,
    ) -> Result<bool, QueueError> {
        let settings = &self.definition.buffering;
        let threshold = settings.change_visibility_buffer_size();
        if settings.is_buffering_disabled() || threshold <= 1 {
            self.ensure_active("change visibility")?;
            self.client
                .change_message_visibility(self.queue_url(), &receipt, visibility_timeout)
                .await?;
            return Ok(true);
        }

        self.enqueue(
            &self.pending_visibility,
            ChangeVisibilityEntry::new(receipt, visibility_timeout),
            threshold,
            "change visibility",
        )
        .await
    }

    /// Receive one message, long-polling up to `wait_time_seconds` when
    /// nothing is cached
    pub async fn receive(
        &self,
        wait_time_seconds: u32,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        self.ensure_active("receive")?;

        if let Some(message) = lock(&self.received).pop_front() {
            return Ok(Some(message));
        }

        let settings = &self.definition.buffering;
        let max_messages = if settings.is_buffering_disabled() {
            1
        } else {
            settings.receive_buffer_size()
        };
        let request = ReceiveRequest::new(max_messages as u32).with_wait_time(wait_time_seconds);

        let mut messages = self
            .client
            .receive_messages(self.queue_url(), &request)
            .await?
            .into_iter();
        let first = messages.next();
        lock(&self.received).extend(messages);
        Ok(first)
    }

    /// Submit everything pending now, regardless of thresholds
    pub async fn flush(&self) -> Result<(), QueueError> {
        let _gate = self.flush_gate.lock().await;
        if self.is_disposed() {
            return Ok(());
        }
        self.flush_pending().await
    }

    /// Flush all pending work, return cached received messages to the queue
    /// and reject further operations
    pub async fn dispose(&self) -> Result<(), QueueError> {
        let _gate = self.flush_gate.lock().await;
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.flush_pending().await;
        self.release_cached_messages().await;
        debug!(queue = %self.queue_name(), "Disposed message buffer");
        result
    }

    fn ensure_active(&self, operation: &str) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::invalid_state(
                operation,
                format_args!("buffer for '{}' is disposed", self.queue_name()),
            ));
        }
        Ok(())
    }

    async fn enqueue<E: BatchEntry>(
        &self,
        pending: &Mutex<Vec<E>>,
        entry: E,
        threshold: usize,
        operation: &str,
    ) -> Result<bool, QueueError> {
        let id = entry.id().to_string();
        let batch = {
            let mut pending = lock(pending);
            // Checked under the lock so nothing lands in a list dispose already drained.
            self.ensure_active(operation)?;
            pending.push(entry);
            if pending.len() >= threshold {
                std::mem::take(&mut *pending)
            } else {
                return Ok(false);
            }
        };

        let succeeded = self.flush_entries(batch).await?;
        Ok(succeeded.contains(&id))
    }

    async fn flush_pending(&self) -> Result<(), QueueError> {
        let sends = std::mem::take(&mut *lock(&self.pending_sends));
        let deletes = std::mem::take(&mut *lock(&self.pending_deletes));
        let visibility = std::mem::take(&mut *lock(&self.pending_visibility));

        let mut first_error = None;
        if let Err(e) = self.flush_entries(sends).await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.flush_entries(deletes).await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.flush_entries(visibility).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Submit entries in chunks; returns the ids the remote service accepted.
    ///
    /// A failed call reports every entry it carried, and every entry not yet
    /// submitted, to the error handler before the error is returned.
    async fn flush_entries<E: BatchEntry>(
        &self,
        entries: Vec<E>,
    ) -> Result<HashSet<String>, QueueError> {
        let mut succeeded = HashSet::new();
        let mut chunks = entries.chunks(MAX_BATCH_SIZE);

        while let Some(chunk) = chunks.next() {
            match E::submit(self.client.as_ref(), self.queue_url(), chunk).await {
                Ok(result) => {
                    for failure in result.failed {
                        self.report(E::OPERATION, failure);
                    }
                    succeeded.extend(result.successful.into_iter().map(|entry| entry.id));
                }
                Err(e) => {
                    error!(
                        queue = %self.queue_name(),
                        operation = %E::OPERATION,
                        error = %e,
                        "Batch call failed"
                    );
                    for entry in chunk.iter().chain(chunks.by_ref().flatten()) {
                        self.report(
                            E::OPERATION,
                            BatchItemError::from_queue_error(entry.id(), &e),
                        );
                    }
                    return Err(e);
                }
            }
        }

        if !succeeded.is_empty() {
            debug!(
                queue = %self.queue_name(),
                operation = %E::OPERATION,
                count = succeeded.len(),
                "Flushed buffered operations"
            );
        }
        Ok(succeeded)
    }

    fn report(&self, operation: BufferedOperation, error: BatchItemError) {
        let failure = BufferedOperationError {
            queue_name: self.queue_name().clone(),
            operation,
            error,
        };

        match &self.error_handler {
            Some(handler) => (handler.as_ref())(&failure),
            None => warn!(
                queue = %failure.queue_name,
                operation = %failure.operation,
                id = %failure.error.id,
                code = %failure.error.code,
                "Buffered operation failed"
            ),
        }
    }

    /// Make cached, never-handed-out messages visible again
    pub async fn release_cached_messages(&self) {
        let cached: Vec<ChangeVisibilityEntry> = lock(&self.received)
            .drain(..)
            .map(|m| ChangeVisibilityEntry::new(m.receipt_handle, 0))
            .collect();

        for chunk in cached.chunks(MAX_BATCH_SIZE) {
            if let Err(e) = self
                .client
                .change_message_visibility_batch(self.queue_url(), chunk)
                .await
            {
                debug!(queue = %self.queue_name(), error = %e, "Could not release cached messages");
            }
        }
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        let sends = lock(&self.pending_sends).len();
        let deletes = lock(&self.pending_deletes).len();
        let visibility = lock(&self.pending_visibility).len();
        if sends + deletes + visibility > 0 {
            warn!(
                queue = %self.definition.queue_name,
                sends = sends,
                deletes = deletes,
                visibility_changes = visibility,
                "Message buffer dropped with unflushed operations"
            );
        }
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("queue", &self.definition.queue_name)
            .field("pending_sends", &self.pending_send_count())
            .field("pending_deletes", &self.pending_delete_count())
            .field("pending_visibility", &self.pending_change_visibility_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ============================================================================
// Buffer Factory
// ============================================================================

type BufferRegistry = DashMap<QueueName, Weak<MessageBuffer>>;

/// Background task flushing every live buffer on a fixed interval
struct FlushTimer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    fn spawn(registry: Arc<BufferRegistry>, interval: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => flush_registry(&registry).await,
                    _ = stop_rx.changed() => {
                        flush_registry(&registry).await;
                        break;
                    }
                }
            }
            debug!("Flush timer stopped");
        });

        Self { stop, handle }
    }

    /// Stop after one final flush
    async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(error = %e, "Flush timer panicked");
            }
        }
    }
}

async fn flush_registry(registry: &BufferRegistry) {
    registry.retain(|_, buffer| buffer.strong_count() > 0);
    let live: Vec<Arc<MessageBuffer>> = registry
        .iter()
        .filter_map(|entry| entry.value().upgrade())
        .collect();

    for buffer in live {
        if !buffer.has_pending() {
            continue;
        }
        if let Err(e) = buffer.flush().await {
            warn!(queue = %buffer.queue_name(), error = %e, "Timed flush failed");
        }
    }
}

/// Hands out one [`MessageBuffer`] per queue and owns the shared flush timer.
///
/// The registry holds weak references only: a buffer lives as long as its
/// owners keep it, and the timer simply skips buffers that are gone.
pub struct BufferFactory {
    client: Arc<dyn SqsClient>,
    registry: Arc<BufferRegistry>,
    error_handler: Option<BufferErrorHandler>,
    flush_interval: Mutex<Duration>,
    timer: Mutex<Option<FlushTimer>>,
}

impl BufferFactory {
    /// Create a factory; a zero `flush_interval` disables the timer
    pub fn new(
        client: Arc<dyn SqsClient>,
        error_handler: Option<BufferErrorHandler>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            client,
            registry: Arc::new(DashMap::new()),
            error_handler,
            flush_interval: Mutex::new(flush_interval),
            timer: Mutex::new(None),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        *lock(&self.flush_interval)
    }

    pub fn is_timer_running(&self) -> bool {
        lock(&self.timer).is_some()
    }

    /// Number of registered buffers that are still alive
    pub fn live_buffer_count(&self) -> usize {
        self.registry
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// The queue's buffer, created on first use.
    ///
    /// Starts the flush timer if it is enabled and not yet running.
    pub fn get_or_create_buffer(&self, definition: Arc<QueueDefinition>) -> Arc<MessageBuffer> {
        let buffer = match self.registry.entry(definition.queue_name.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(existing) if !existing.is_disposed() => existing,
                _ => {
                    let created = self.new_buffer(definition);
                    occupied.insert(Arc::downgrade(&created));
                    created
                }
            },
            Entry::Vacant(vacant) => {
                let created = self.new_buffer(definition);
                vacant.insert(Arc::downgrade(&created));
                created
            }
        };

        self.ensure_timer();
        buffer
    }

    /// Change the timer interval.
    ///
    /// A running timer performs one final flush before it stops; zero leaves
    /// the timer off afterwards.
    pub async fn set_flush_interval(&self, interval: Duration) {
        *lock(&self.flush_interval) = interval;
        let previous = lock(&self.timer).take();
        if let Some(timer) = previous {
            timer.shutdown().await;
        }
        if !self.registry.is_empty() {
            self.ensure_timer();
        }
        info!(interval_ms = interval.as_millis() as u64, "Changed buffer flush interval");
    }

    /// Flush every live buffer now
    pub async fn flush_all(&self) {
        flush_registry(&self.registry).await;
    }

    /// Stop the timer and dispose every live buffer
    pub async fn dispose(&self) -> Result<(), QueueError> {
        let previous = lock(&self.timer).take();
        if let Some(timer) = previous {
            timer.shutdown().await;
        }

        let live: Vec<Arc<MessageBuffer>> = self
            .registry
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.registry.clear();

        let mut first_error = None;
        for buffer in live {
            if let Err(e) = buffer.dispose().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn new_buffer(&self, definition: Arc<QueueDefinition>) -> Arc<MessageBuffer> {
        Arc::new(MessageBuffer::new(
            definition,
            Arc::clone(&self.client),
            self.error_handler.clone(),
        ))
    }

    fn ensure_timer(&self) {
        let interval = self.flush_interval();
        if interval.is_zero() {
            return;
        }

        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No async runtime; flush timer not started");
            return;
        }
        *timer = Some(FlushTimer::spawn(Arc::clone(&self.registry), interval));
    }
}

impl Drop for BufferFactory {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.handle.abort();
        }
    }
}
