//! # SQS Message Queue
//!
//! Message queue client and server built on an at-least-once, batch-oriented
//! remote queuing service (AWS SQS or the in-memory emulation).
//!
//! This library provides:
//! - Queue lifecycle management with a shared definition cache
//! - Client-side batching of send, delete, change-visibility and receive
//! - Request/reply over temporary queues
//! - A multi-worker message server with retries and dead-letter routing
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Queue names, messages and receipt handles
//! - [`provider`] - Provider types and configuration
//! - [`client`] - Remote service interface and client factory
//! - [`providers`] - AWS SQS and in-memory implementations
//! - [`queue_manager`] - Queue creation, lookup, caching and cleanup
//! - [`buffer`] - Per-queue batching and the shared flush timer
//! - [`mq_client`] - Message factory and client used by applications
//! - [`server`] - Message server and handler registration
//! - [`stats`] - Server statistics
//! - [`config`] - Layered settings
//!
//! ## Example
//!
//! ```rust,no_run
//! use sqs_mq::{Message, MessageFactory, MessageServer, MqSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), sqs_mq::QueueError> {
//! let settings = MqSettings::load(None)?;
//! let factory = MessageFactory::from_settings(&settings)?;
//!
//! let server = MessageServer::new(factory.clone(), settings.server.clone());
//! server.register_handler_fn(
//!     "Greet",
//!     |context| async move {
//!         let name = context.body_str().unwrap_or("stranger").to_string();
//!         Ok::<_, anyhow::Error>(Some(Message::new(format!("Hello, {}!", name))))
//!     },
//!     1,
//! )?;
//! server.start().await?;
//!
//! let client = factory.create_client();
//! let reply = client
//!     .request("Greet", Message::new("World"), Duration::from_secs(10))
//!     .await?;
//! assert_eq!(reply.body_str(), Some("Hello, World!"));
//!
//! server.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod mq_client;
pub mod provider;
pub mod providers;
pub mod queue_manager;
pub mod server;
pub mod stats;

// Re-export commonly used types at crate root for convenience
pub use buffer::{
    BufferErrorHandler, BufferFactory, BufferedOperation, BufferedOperationError, MessageBuffer,
};
pub use client::{BatchResult, QueueClientFactory, ReceiveRequest, SqsClient};
pub use config::{FlushSettings, MqSettings, QueueSettings};
pub use error::{
    BatchConstraintViolation, BatchItemError, ConfigurationError, QueueError, SerializationError,
    ValidationError,
};
pub use message::{
    to_valid_queue_name, Message, MessageId, QueueName, QueueNames, ReceiptHandle,
    ReceivedMessage, Timestamp,
};
pub use mq_client::{MessageFactory, MessageQueueClient};
pub use provider::{AwsSqsConfig, InMemoryConfig, ProviderConfig, ProviderType};
pub use providers::{AwsSqsProvider, InMemorySqs};
pub use queue_manager::{
    BufferSettings, QueueCache, QueueDefinition, QueueManager, QueueOptions, RedrivePolicy,
    WorkerQueueOptions,
};
pub use server::{MessageContext, MessageHandler, MessageServer, MessageServerConfig, ServerStatus};
pub use stats::{MessageHandlerStats, ServerStats};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
