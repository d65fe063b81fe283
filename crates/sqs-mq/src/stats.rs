//! Message server statistics.
//!
//! Counters only ever grow for the lifetime of a server; stopping and
//! restarting does not reset them.

use crate::message::Timestamp;
use crate::server::ServerStatus;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;

/// Live counters of one registered message type
#[derive(Debug, Default)]
pub(crate) struct HandlerCounters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    last_processed: Mutex<Option<Timestamp>>,
}

impl HandlerCounters {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_processed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Some(Timestamp::now());
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, message_type: &str, thread_count: usize) -> MessageHandlerStats {
        MessageHandlerStats {
            message_type: message_type.to_string(),
            thread_count,
            total_messages_received: self.received.load(Ordering::Relaxed),
            total_messages_processed: self.processed.load(Ordering::Relaxed),
            total_messages_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            total_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_message_processed: self
                .last_processed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Server-wide totals across all message types
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
}

/// Point-in-time statistics of one message type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHandlerStats {
    pub message_type: String,
    pub thread_count: usize,
    pub total_messages_received: u64,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    /// Messages the server forwarded to a dead-letter queue itself
    pub total_dead_lettered: u64,
    pub last_message_processed: Option<Timestamp>,
}

/// Point-in-time statistics of a message server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    pub status: ServerStatus,
    pub bg_thread_count: u64,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub handlers: Vec<MessageHandlerStats>,
}

impl ServerStats {
    pub fn handler(&self, message_type: &str) -> Option<&MessageHandlerStats> {
        self.handlers.iter().find(|h| h.message_type == message_type)
    }
}

impl fmt::Display for MessageHandlerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {} ({} worker(s))", self.message_type, self.thread_count)?;
        writeln!(f, "    received:      {}", self.total_messages_received)?;
        writeln!(f, "    processed:     {}", self.total_messages_processed)?;
        writeln!(f, "    failed:        {}", self.total_messages_failed)?;
        writeln!(f, "    retries:       {}", self.total_retries)?;
        writeln!(f, "    dead-lettered: {}", self.total_dead_lettered)?;
        match &self.last_message_processed {
            Some(at) => writeln!(f, "    last processed: {}", at),
            None => writeln!(f, "    last processed: never"),
        }
    }
}

impl fmt::Display for ServerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MessageServer")?;
        writeln!(f, "  status:                   {}", self.status)?;
        writeln!(f, "  background thread starts: {}", self.bg_thread_count)?;
        writeln!(f, "  total processed:          {}", self.total_messages_processed)?;
        writeln!(f, "  total failed:             {}", self.total_messages_failed)?;
        if self.handlers.is_empty() {
            return writeln!(f, "  no handlers registered");
        }
        writeln!(f, "Handlers")?;
        for handler in &self.handlers {
            write!(f, "{}", handler)?;
        }
        Ok(())
    }
}
