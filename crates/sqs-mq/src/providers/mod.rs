//! Remote queue service implementations.
//!
//! This module contains concrete implementations of the [`SqsClient`](crate::client::SqsClient)
//! trait: the AWS SQS query API and an in-memory emulation used by tests and
//! local development.

pub mod aws;
pub mod memory;

pub use aws::{AwsError, AwsSqsProvider};
pub use memory::InMemorySqs;
