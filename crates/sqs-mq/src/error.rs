//! Error types for queue operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue '{queue_name}' already exists with different attributes: {message}")]
    QueueNameConflict { queue_name: String, message: String },

    #[error("Receipt handle is invalid or expired: {receipt}")]
    InvalidReceiptHandle { receipt: String },

    #[error("Batch rejected: {0}")]
    BatchConstraint(#[from] BatchConstraintViolation),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::QueueNameConflict { .. } => false,
            Self::InvalidReceiptHandle { .. } => false,
            Self::BatchConstraint(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::Timeout { .. } => true,
            Self::InvalidState { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if the error reports a missing queue
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }

    /// Short machine-readable code, used when a whole-batch failure is
    /// reported item by item
    pub fn code(&self) -> &str {
        match self {
            Self::QueueNotFound { .. } => "QueueDoesNotExist",
            Self::QueueNameConflict { .. } => "QueueAlreadyExists",
            Self::InvalidReceiptHandle { .. } => "ReceiptHandleIsInvalid",
            Self::BatchConstraint(violation) => violation.code(),
            Self::MessageTooLarge { .. } => "MessageTooLong",
            Self::Timeout { .. } => "Timeout",
            Self::InvalidState { .. } => "InvalidState",
            Self::ConnectionFailed { .. } => "ConnectionFailed",
            Self::AuthenticationFailed { .. } => "AuthenticationFailed",
            Self::ProviderError { code, .. } => code,
            Self::SerializationError(_) => "SerializationError",
            Self::ConfigurationError(_) => "ConfigurationError",
            Self::ValidationError(_) => "ValidationError",
        }
    }

    pub(crate) fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

/// Reasons a batch request is rejected before it reaches the remote service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchConstraintViolation {
    #[error("batch contains no entries")]
    Empty,

    #[error("batch contains {count} entries (max: {max})")]
    TooManyEntries { count: usize, max: usize },

    #[error("batch entry id '{id}' is used more than once")]
    DuplicateId { id: String },

    #[error("batch entry id '{id}' is malformed")]
    InvalidId { id: String },
}

impl BatchConstraintViolation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "EmptyBatchRequest",
            Self::TooManyEntries { .. } => "TooManyEntriesInBatchRequest",
            Self::DuplicateId { .. } => "BatchEntryIdsNotDistinct",
            Self::InvalidId { .. } => "InvalidBatchEntryId",
        }
    }
}

/// Failure of a single entry inside an otherwise accepted batch call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch entry '{id}' failed: {code} - {message}")]
pub struct BatchItemError {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

impl BatchItemError {
    pub fn new(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            message: message.into(),
            sender_fault: true,
        }
    }

    /// Build an item failure from an error that took down the whole batch
    pub fn from_queue_error(id: impl Into<String>, error: &QueueError) -> Self {
        Self {
            id: id.into(),
            code: error.code().to_string(),
            message: error.to_string(),
            sender_fault: !error.is_transient(),
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Message attribute '{key}' has invalid value")]
    InvalidAttribute { key: String },

    #[error("Malformed service response: {message}")]
    MalformedResponse { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
