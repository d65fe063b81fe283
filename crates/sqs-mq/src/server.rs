//! Multi-worker message server.
//!
//! Handlers are registered per message type. Starting the server creates each
//! type's inbound queue (and, unless disabled, a dead-letter queue wired
//! through a redrive policy) and spawns the configured number of workers per
//! type. Every worker long-polls its inbound queue, invokes the handler and
//! routes non-empty results to the message's `ReplyTo` queue or the type's
//! out queue.
//!
//! A failed delivery is made visible again until it has been attempted
//! `1 + retry_count` times; after that it is left to the queue's redrive
//! policy. Deliveries beyond that count (no redrive in effect) are moved to
//! the dead-letter queue by the server itself.
//!
//! # Lifecycle
//!
//! `Stopped → Starting → Started → Stopping → Stopped`, with `Disposed`
//! reachable from every state. Transitions are compare-and-swap on an atomic
//! status, so concurrent [`MessageServer::start`] calls collapse into one
//! startup and a [`MessageServer::stop`] arriving during startup is applied as
//! soon as startup finishes.

use crate::error::{QueueError, ValidationError};
use crate::message::{Message, QueueName, ReceivedMessage};
use crate::mq_client::{MessageFactory, MessageQueueClient};
use crate::queue_manager::{QueueOptions, WorkerQueueOptions};
use crate::stats::{HandlerCounters, ServerCounters, ServerStats};
use crate::client::{MAX_RECEIVE_WAIT_SECS, MAX_VISIBILITY_TIMEOUT_SECS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

/// Pause after an empty short poll or a failed receive
const IDLE_DELAY: Duration = Duration::from_millis(100);
const RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration
// ============================================================================

/// Message server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageServerConfig {
    /// Additional attempts after the first failed one
    pub retry_count: u32,
    /// Long-poll wait of each worker receive, at most 20 seconds
    pub worker_wait_seconds: u32,
    /// Visibility timeout of the inbound queues
    pub visibility_timeout: u32,
    /// Workers per message type when registration asks for zero
    pub default_thread_count: usize,
    /// Create `{prefix}:{type}.dlq` and a redrive policy for every type
    pub create_dead_letter_queues: bool,
}

impl Default for MessageServerConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            worker_wait_seconds: MAX_RECEIVE_WAIT_SECS,
            visibility_timeout: 30,
            default_thread_count: 1,
            create_dead_letter_queues: true,
        }
    }
}

impl MessageServerConfig {
    fn worker_queue_options(&self) -> WorkerQueueOptions {
        WorkerQueueOptions {
            visibility_timeout: self.visibility_timeout.min(MAX_VISIBILITY_TIMEOUT_SECS),
            receive_wait_time: self.worker_wait_seconds.min(MAX_RECEIVE_WAIT_SECS),
            disable_buffering: false,
            retry_count: self.retry_count,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a message server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ServerStatus {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Disposed = 4,
}

/// Raw status of a server still starting up with a stop already queued;
/// reported as `Starting`
const STOP_PENDING: u8 = 5;

impl ServerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 | STOP_PENDING => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Disposed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
            Self::Disposed => "Disposed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Everything a handler gets for one delivery
#[derive(Clone)]
pub struct MessageContext {
    pub message: ReceivedMessage,
    pub message_type: String,
    /// Client for publishing follow-up messages
    pub client: MessageQueueClient,
}

impl MessageContext {
    pub fn body_str(&self) -> Option<&str> {
        self.message.body_str()
    }
}

/// Processes messages of one type.
///
/// `Ok(Some(reply))` is published to the message's `ReplyTo` queue, or to
/// the type's out queue when there is none. `Ok(None)` publishes nothing. An
/// error (or a panic) counts as a failed attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, context: &MessageContext) -> anyhow::Result<Option<Message>>;
}

struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
{
    async fn handle(&self, context: &MessageContext) -> anyhow::Result<Option<Message>> {
        (self.handler)(context.clone()).await
    }
}

#[derive(Clone)]
struct HandlerRegistration {
    handler: Arc<dyn MessageHandler>,
    thread_count: usize,
    counters: Arc<HandlerCounters>,
}

// ============================================================================
// Workers
// ============================================================================

/// Workers of one start/stop generation
struct WorkerGeneration {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGeneration {
    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Worker panicked");
                }
            }
        }
    }
}

struct Worker {
    message_type: String,
    inbound: QueueName,
    out_queue: QueueName,
    registration: HandlerRegistration,
    totals: Arc<ServerCounters>,
    client: MessageQueueClient,
    retry_count: u32,
    wait_seconds: u32,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(message_type = %self.message_type, queue = %self.inbound, "Worker started");
        let wait = Duration::from_secs(u64::from(self.wait_seconds));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.client.get(&self.inbound, wait) => received,
            };

            match received {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) if self.wait_seconds == 0 => {
                    if pause(&mut shutdown, IDLE_DELAY).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        message_type = %self.message_type,
                        queue = %self.inbound,
                        error = %e,
                        "Receive failed"
                    );
                    if pause(&mut shutdown, RECEIVE_ERROR_DELAY).await {
                        break;
                    }
                }
            }
        }

        debug!(message_type = %self.message_type, "Worker stopped");
    }

    async fn process(&self, message: ReceivedMessage) {
        let counters = &self.registration.counters;
        let max_deliveries = self.retry_count.saturating_add(1);

        if message.has_exceeded_receive_count(max_deliveries) {
            if let Err(e) = self.client.nak(&message, false).await {
                error!(message_id = %message.message_id, error = %e, "Failed to dead-letter message");
            } else {
                counters.record_dead_lettered();
            }
            return;
        }

        counters.record_received();
        let context = MessageContext {
            message,
            message_type: self.message_type.clone(),
            client: self.client.clone(),
        };

        let handler = Arc::clone(&self.registration.handler);
        let task_context = context.clone();
        let outcome = tokio::spawn(async move { handler.handle(&task_context).await }).await;

        match outcome {
            Ok(Ok(reply)) => self.complete(&context.message, reply).await,
            Ok(Err(e)) => self.fail(&context.message, &format!("{:#}", e)).await,
            Err(e) => self.fail(&context.message, &format!("handler panicked: {}", e)).await,
        }
    }

    async fn complete(&self, message: &ReceivedMessage, reply: Option<Message>) {
        if let Some(reply) = reply {
            let target = message.reply_to.as_ref().unwrap_or(&self.out_queue);
            if let Err(e) = self.client.publish_to(target, reply).await {
                // The request is left undeleted so it is delivered again.
                error!(
                    message_id = %message.message_id,
                    target = %target,
                    error = %e,
                    "Failed to publish handler result"
                );
                self.fail(message, "result could not be published").await;
                return;
            }
        }

        if let Err(e) = self.client.ack(message).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to delete processed message");
        }
        self.registration.counters.record_processed();
        self.totals.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn fail(&self, message: &ReceivedMessage, reason: &str) {
        let counters = &self.registration.counters;
        counters.record_failed();
        self.totals.failed.fetch_add(1, Ordering::Relaxed);

        let retrying = message.receive_count <= self.retry_count;
        if retrying {
            counters.record_retry();
        }
        warn!(
            message_type = %self.message_type,
            message_id = %message.message_id,
            attempt = message.receive_count,
            retrying = retrying,
            reason = %reason,
            "Handler failed"
        );

        // Either way the message becomes visible again; once retries are used
        // up the next receive hands it to the redrive policy.
        if let Err(e) = self.client.nak(message, true).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to requeue message");
        }
    }
}

/// Sleep unless shutdown is signalled first; returns true on shutdown
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

// ============================================================================
// Message Server
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Long-running consumer dispatching messages to registered handlers
pub struct MessageServer {
    factory: MessageFactory,
    config: MessageServerConfig,
    handlers: RwLock<BTreeMap<String, HandlerRegistration>>,
    status: AtomicU8,
    bg_thread_count: AtomicU64,
    workers: Mutex<Option<WorkerGeneration>>,
    totals: Arc<ServerCounters>,
}

impl MessageServer {
    pub fn new(factory: MessageFactory, config: MessageServerConfig) -> Self {
        Self {
            factory,
            config,
            handlers: RwLock::new(BTreeMap::new()),
            status: AtomicU8::new(ServerStatus::Stopped as u8),
            bg_thread_count: AtomicU64::new(0),
            workers: Mutex::new(None),
            totals: Arc::new(ServerCounters::default()),
        }
    }

    pub fn config(&self) -> &MessageServerConfig {
        &self.config
    }

    pub fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Client sharing this server's buffers
    pub fn create_client(&self) -> MessageQueueClient {
        self.factory.create_client()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// How many times workers have been started
    pub fn bg_thread_count(&self) -> u64 {
        self.bg_thread_count.load(Ordering::Acquire)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Register the handler of `message_type` with `thread_count` workers
    /// (zero means the configured default).
    ///
    /// Only allowed while the server is stopped; registering a type again
    /// replaces its handler and keeps its statistics.
    pub fn register_handler<H>(
        &self,
        message_type: impl Into<String>,
        handler: H,
        thread_count: usize,
    ) -> Result<(), QueueError>
    where
        H: MessageHandler + 'static,
    {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(ValidationError::Required {
                field: "message_type".to_string(),
            }
            .into());
        }
        let names = self.factory.names();
        names.in_queue(&message_type)?;
        names.dead_letter_queue(&message_type)?;

        let status = self.status();
        if status != ServerStatus::Stopped {
            return Err(QueueError::invalid_state(
                "register a handler",
                format_args!("server is {}", status),
            ));
        }

        let thread_count = if thread_count == 0 {
            self.config.default_thread_count.max(1)
        } else {
            thread_count
        };

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let counters = handlers
            .get(&message_type)
            .map(|existing| Arc::clone(&existing.counters))
            .unwrap_or_default();
        handlers.insert(
            message_type.clone(),
            HandlerRegistration {
                handler: Arc::new(handler),
                thread_count,
                counters,
            },
        );
        info!(message_type = %message_type, threads = thread_count, "Registered handler");
        Ok(())
    }

    /// Register an async closure as the handler of `message_type`
    pub fn register_handler_fn<F, Fut>(
        &self,
        message_type: impl Into<String>,
        handler: F,
        thread_count: usize,
    ) -> Result<(), QueueError>
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
    {
        self.register_handler(message_type, FnHandler { handler }, thread_count)
    }

    /// Create the queues of every registered type and spawn their workers.
    ///
    /// Does nothing when the server is already starting or running.
    ///
    /// # Errors
    ///
    /// `InvalidState` once disposed; queue creation errors leave the server
    /// stopped.
    pub async fn start(&self) -> Result<(), QueueError> {
        if let Err(current) = self.transition(ServerStatus::Stopped, ServerStatus::Starting) {
            return match current {
                ServerStatus::Disposed => {
                    Err(QueueError::invalid_state("start", "server is disposed"))
                }
                _ => {
                    debug!(status = %current, "Start ignored");
                    Ok(())
                }
            };
        }

        let generation = match self.spawn_workers().await {
            Ok(generation) => generation,
            Err(e) => {
                error!(error = %e, "Message server failed to start");
                // A queued stop is satisfied by staying stopped.
                if self
                    .transition(ServerStatus::Starting, ServerStatus::Stopped)
                    .is_err()
                {
                    let _ = self.transition_raw(STOP_PENDING, ServerStatus::Stopped as u8);
                }
                return Err(e);
            }
        };
        let worker_count = generation.handles.len();
        *lock(&self.workers) = Some(generation);
        let generation_number = self.bg_thread_count.fetch_add(1, Ordering::AcqRel) + 1;

        let stop_queued = match self.transition(ServerStatus::Starting, ServerStatus::Started) {
            Ok(()) => false,
            Err(_) => {
                if self
                    .transition_raw(STOP_PENDING, ServerStatus::Started as u8)
                    .is_err()
                {
                    // Disposed while starting.
                    self.shutdown_workers().await;
                    return Err(QueueError::invalid_state("start", "server is disposed"));
                }
                true
            }
        };
        info!(
            workers = worker_count,
            generation = generation_number,
            "Message server started"
        );

        if stop_queued {
            debug!("Applying stop requested during startup");
            self.stop().await?;
        }
        Ok(())
    }

    /// Signal every worker to stop and wait for them to exit.
    ///
    /// In-flight handler calls run to completion. A stop during startup is
    /// applied once startup finishes.
    pub async fn stop(&self) -> Result<(), QueueError> {
        loop {
            let raw = self.status.load(Ordering::Acquire);
            if raw == STOP_PENDING {
                return Ok(());
            }
            match ServerStatus::from_u8(raw) {
                ServerStatus::Disposed => {
                    return Err(QueueError::invalid_state("stop", "server is disposed"))
                }
                ServerStatus::Stopped | ServerStatus::Stopping => return Ok(()),
                ServerStatus::Starting => {
                    if self
                        .transition_raw(ServerStatus::Starting as u8, STOP_PENDING)
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                ServerStatus::Started => {
                    if self
                        .transition(ServerStatus::Started, ServerStatus::Stopping)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        self.shutdown_workers().await;
        self.release_inbound_caches().await;
        let _ = self.transition(ServerStatus::Stopping, ServerStatus::Stopped);
        info!("Message server stopped");
        Ok(())
    }

    /// Stop, flush every buffer and reject any further start or stop
    pub async fn dispose(&self) -> Result<(), QueueError> {
        let previous = self
            .status
            .swap(ServerStatus::Disposed as u8, Ordering::AcqRel);
        if ServerStatus::from_u8(previous) == ServerStatus::Disposed {
            return Ok(());
        }

        self.shutdown_workers().await;
        let result = self.factory.dispose().await;
        info!("Message server disposed");
        result
    }

    pub fn get_status(&self) -> String {
        self.status().to_string()
    }

    pub fn get_stats(&self) -> ServerStats {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(message_type, registration)| {
                registration
                    .counters
                    .snapshot(message_type, registration.thread_count)
            })
            .collect();

        ServerStats {
            status: self.status(),
            bg_thread_count: self.bg_thread_count(),
            total_messages_processed: self.totals.processed.load(Ordering::Relaxed),
            total_messages_failed: self.totals.failed.load(Ordering::Relaxed),
            handlers,
        }
    }

    /// Multi-line rendering of [`get_stats`](Self::get_stats)
    pub fn get_stats_description(&self) -> String {
        self.get_stats().to_string()
    }

    fn transition(&self, from: ServerStatus, to: ServerStatus) -> Result<(), ServerStatus> {
        self.transition_raw(from as u8, to as u8)
            .map_err(ServerStatus::from_u8)
    }

    fn transition_raw(&self, from: u8, to: u8) -> Result<(), u8> {
        self.status
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    async fn spawn_workers(&self) -> Result<WorkerGeneration, QueueError> {
        let registrations: Vec<(String, HandlerRegistration)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(message_type, registration)| (message_type.clone(), registration.clone()))
            .collect();

        let mut workers = Vec::new();
        for (message_type, registration) in registrations {
            let inbound = self.create_worker_queues(&message_type).await?;
            let out_queue = self.factory.names().out_queue(&message_type)?;
            for _ in 0..registration.thread_count {
                workers.push(Worker {
                    message_type: message_type.clone(),
                    inbound: inbound.clone(),
                    out_queue: out_queue.clone(),
                    registration: registration.clone(),
                    totals: Arc::clone(&self.totals),
                    client: self.factory.create_client(),
                    retry_count: self.config.retry_count,
                    wait_seconds: self.config.worker_wait_seconds.min(MAX_RECEIVE_WAIT_SECS),
                });
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(shutdown_rx.clone())))
            .collect();
        Ok(WorkerGeneration { shutdown, handles })
    }

    async fn create_worker_queues(&self, message_type: &str) -> Result<QueueName, QueueError> {
        let names = self.factory.names();
        let manager = self.factory.queue_manager();
        let worker_options = self.config.worker_queue_options();

        let dead_letter_arn = if self.config.create_dead_letter_queues {
            let dead_letter = manager
                .create_queue(&names.dead_letter_queue(message_type)?, &QueueOptions::default())
                .await?;
            dead_letter.queue_arn.clone()
        } else {
            None
        };

        let inbound = names.in_queue(message_type)?;
        manager
            .create_queue_for_worker(&inbound, &worker_options, dead_letter_arn.as_deref())
            .await?;
        Ok(inbound)
    }

    /// Return look-ahead messages of every inbound queue to the queue
    async fn release_inbound_caches(&self) {
        for message_type in self.registered_types() {
            if let Ok(inbound) = self.factory.names().in_queue(&message_type) {
                self.factory.release_cached_messages(&inbound).await;
            }
        }
    }

    async fn shutdown_workers(&self) {
        let generation = lock(&self.workers).take();
        if let Some(generation) = generation {
            generation.shutdown().await;
        }
    }
}

impl Drop for MessageServer {
    fn drop(&mut self) {
        if let Some(generation) = lock(&self.workers).take() {
            let _ = generation.shutdown.send(true);
        }
    }
}
