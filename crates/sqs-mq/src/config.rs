//! Layered settings for the message queue stack.
//!
//! Every field has a default, so an absent file and an empty environment
//! produce valid settings. Sources are applied in order: built-in defaults,
//! an optional settings file (format chosen by extension), then environment
//! variables prefixed `SQS_MQ` using `__` as the section separator, e.g.
//! `SQS_MQ__SERVER__RETRY_COUNT=3`.

use crate::client::{MAX_BATCH_SIZE, MAX_RECEIVE_WAIT_SECS, MAX_VISIBILITY_TIMEOUT_SECS};
use crate::error::ConfigurationError;
use crate::provider::ProviderConfig;
use crate::server::MessageServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "SQS_MQ";

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqSettings {
    /// Prefix of per-message-type queue names
    pub queue_prefix: String,
    pub provider: ProviderConfig,
    pub queues: QueueSettings,
    pub buffer: FlushSettings,
    pub server: MessageServerConfig,
}

impl Default for MqSettings {
    fn default() -> Self {
        Self {
            queue_prefix: "mq".to_string(),
            provider: ProviderConfig::default(),
            queues: QueueSettings::default(),
            buffer: FlushSettings::default(),
            server: MessageServerConfig::default(),
        }
    }
}

/// Defaults applied to queues created without explicit attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub disable_buffering: bool,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub delete_buffer_size: usize,
    pub change_visibility_buffer_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            receive_wait_time: 0,
            disable_buffering: false,
            send_buffer_size: MAX_BATCH_SIZE,
            receive_buffer_size: MAX_BATCH_SIZE,
            delete_buffer_size: MAX_BATCH_SIZE,
            change_visibility_buffer_size: MAX_BATCH_SIZE,
        }
    }
}

/// Shared flush timer of the buffer factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushSettings {
    /// Zero disables the timer
    pub flush_interval_ms: u64,
}

impl FlushSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
        }
    }
}

impl MqSettings {
    /// Load settings from an optional file plus `SQS_MQ__*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// A missing explicit file, a malformed file, an environment value of the
    /// wrong type or an out-of-range value are all errors.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: MqSettings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values outside the protocol limits
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: String| Err(ConfigurationError::Invalid { message });

        if self.queue_prefix.is_empty() {
            return invalid("queue_prefix cannot be empty".to_string());
        }

        let queues = &self.queues;
        if queues.visibility_timeout > MAX_VISIBILITY_TIMEOUT_SECS {
            return invalid(format!(
                "queues.visibility_timeout {} exceeds {}",
                queues.visibility_timeout, MAX_VISIBILITY_TIMEOUT_SECS
            ));
        }
        if queues.receive_wait_time > MAX_RECEIVE_WAIT_SECS {
            return invalid(format!(
                "queues.receive_wait_time {} exceeds {}",
                queues.receive_wait_time, MAX_RECEIVE_WAIT_SECS
            ));
        }
        for (field, size) in [
            ("send_buffer_size", queues.send_buffer_size),
            ("receive_buffer_size", queues.receive_buffer_size),
            ("delete_buffer_size", queues.delete_buffer_size),
            (
                "change_visibility_buffer_size",
                queues.change_visibility_buffer_size,
            ),
        ] {
            if !(1..=MAX_BATCH_SIZE).contains(&size) {
                return invalid(format!(
                    "queues.{} must be between 1 and {}, got {}",
                    field, MAX_BATCH_SIZE, size
                ));
            }
        }

        let server = &self.server;
        if server.worker_wait_seconds > MAX_RECEIVE_WAIT_SECS {
            return invalid(format!(
                "server.worker_wait_seconds {} exceeds {}",
                server.worker_wait_seconds, MAX_RECEIVE_WAIT_SECS
            ));
        }
        if server.visibility_timeout > MAX_VISIBILITY_TIMEOUT_SECS {
            return invalid(format!(
                "server.visibility_timeout {} exceeds {}",
                server.visibility_timeout, MAX_VISIBILITY_TIMEOUT_SECS
            ));
        }
        if server.default_thread_count == 0 {
            return invalid("server.default_thread_count must be at least 1".to_string());
        }

        if let ProviderConfig::AwsSqs(aws) = &self.provider {
            if aws.region.is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "provider.region".to_string(),
                });
            }
        }

        Ok(())
    }
}
