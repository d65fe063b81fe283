//! Provider types and configuration.

use serde::{Deserialize, Serialize};

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AwsSqs,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AwsSqs => 256 * 1024,   // 256KB
            Self::InMemory => 256 * 1024, // mirrors the remote limit
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AwsSqs => "AwsSqs",
            Self::InMemory => "InMemory",
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    AwsSqs(AwsSqsConfig),
    InMemory(InMemoryConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::InMemory(InMemoryConfig::default())
    }
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::AwsSqs(_) => ProviderType::AwsSqs,
            Self::InMemory(_) => ProviderType::InMemory,
        }
    }
}

/// AWS SQS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSqsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Override for SQS-compatible endpoints (e.g. a local emulator)
    pub endpoint: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for AwsSqsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            request_timeout_seconds: 30,
        }
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    pub region: String,
    pub account_id: String,
    pub endpoint: String,
    pub max_queue_size: usize,
    /// Newly created queues stay out of `ListQueues` results for this long
    pub list_visibility_delay_ms: u64,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            endpoint: "http://localhost:4566".to_string(),
            max_queue_size: 100_000,
            list_visibility_delay_ms: 0,
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
