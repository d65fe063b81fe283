//! Integration tests for client-side batching
//!
//! These tests verify:
//! - Sends are grouped into batch calls of at most ten entries
//! - Receives are served from a look-ahead cache
//! - Disabling buffering turns every operation into a direct call
//! - The shared timer flushes queues that never reach a threshold
//! - Disposal drains every pending list without losing operations

mod common;

use common::{fast_settings, recording_factory, wait_until, FailureLog};
use sqs_mq::client::attributes;
use sqs_mq::{BufferedOperation, Message, MessageFactory, QueueName, QueueOptions, ReceiptHandle};
use std::time::Duration;

/// Visible and in-flight message counts as reported by the remote service
async fn message_counts(factory: &MessageFactory, queue: &QueueName) -> (u64, u64) {
    let url = factory
        .queue_manager()
        .get_queue_url(queue, false)
        .await
        .unwrap();
    let attrs = factory
        .queue_manager()
        .client()
        .get_queue_attributes(&url)
        .await
        .unwrap();
    let count = |name: &str| attrs.get(name).and_then(|v| v.parse().ok()).unwrap_or(0);
    (
        count(attributes::APPROXIMATE_NUMBER_OF_MESSAGES),
        count(attributes::APPROXIMATE_NUMBER_OF_MESSAGES_NOT_VISIBLE),
    )
}

fn manual_flush_settings() -> sqs_mq::MqSettings {
    let mut settings = fast_settings();
    settings.buffer.flush_interval_ms = 0;
    settings
}

/// Verify that 25 publishes cost three batch calls and no single sends
#[tokio::test]
async fn test_sends_are_batched_by_threshold() {
    let (factory, remote) = recording_factory(&manual_flush_settings(), None);
    let client = factory.create_client();

    let mut flushed_by_call = 0;
    for i in 0..25 {
        if client
            .publish("Bulk", Message::new(format!("m-{}", i)))
            .await
            .unwrap()
        {
            flushed_by_call += 1;
        }
    }

    // The 10th and 20th publish each flushed a full batch.
    assert_eq!(flushed_by_call, 2);
    assert_eq!(remote.calls("send_message_batch"), 2);

    factory.flush().await;

    assert_eq!(remote.calls("send_message_batch"), 3);
    assert_eq!(remote.calls("send_message"), 0);
    let inbound = factory.names().in_queue("Bulk").unwrap();
    assert_eq!(message_counts(&factory, &inbound).await, (25, 0));
}

/// Verify that a queue with buffering disabled sends every message directly
#[tokio::test]
async fn test_disabled_buffering_sends_directly() {
    let (factory, remote) = recording_factory(&manual_flush_settings(), None);
    let queue = QueueName::new("direct").unwrap();
    factory
        .queue_manager()
        .create_queue(&queue, &QueueOptions::default().with_disable_buffering(true))
        .await
        .unwrap();
    let client = factory.create_client();

    for i in 0..5 {
        assert!(client
            .publish_to(&queue, Message::new(i.to_string()))
            .await
            .unwrap());
    }

    assert_eq!(remote.calls("send_message"), 5);
    assert_eq!(remote.calls("send_message_batch"), 0);
    assert_eq!(message_counts(&factory, &queue).await, (5, 0));
}

/// Verify that ten gets are served by one remote receive
#[tokio::test]
async fn test_receives_use_look_ahead_cache() {
    let (factory, remote) = recording_factory(&manual_flush_settings(), None);
    let client = factory.create_client();
    let queue = QueueName::new("reads").unwrap();
    for i in 0..10 {
        client
            .publish_to(&queue, Message::new(i.to_string()))
            .await
            .unwrap();
    }
    remote.reset();

    let mut bodies = Vec::new();
    for _ in 0..10 {
        let message = client
            .get(&queue, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        bodies.push(message.body_str().unwrap().to_string());
    }

    assert_eq!(remote.calls("receive_messages"), 1);
    bodies.sort();
    let mut expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    expected.sort();
    assert_eq!(bodies, expected);
}

/// Verify that the shared timer flushes queues below their thresholds
#[tokio::test]
async fn test_timer_flushes_low_traffic_queues() {
    let (factory, _remote) = recording_factory(&fast_settings(), None);
    let client = factory.create_client();
    let first = QueueName::new("trickle-a").unwrap();
    let second = QueueName::new("trickle-b").unwrap();

    client.publish_to(&first, Message::new("a")).await.unwrap();
    client.publish_to(&second, Message::new("b")).await.unwrap();
    client.publish_to(&second, Message::new("c")).await.unwrap();

    let first_url = factory.queue_manager().get_queue_url(&first, false).await.unwrap();
    let second_url = factory.queue_manager().get_queue_url(&second, false).await.unwrap();
    let remote = factory.queue_manager().client().clone();
    let mut flushed = false;
    for _ in 0..100 {
        let a = remote.get_queue_attributes(&first_url).await.unwrap();
        let b = remote.get_queue_attributes(&second_url).await.unwrap();
        let depth = |attrs: &std::collections::HashMap<String, String>| {
            attrs
                .get(attributes::APPROXIMATE_NUMBER_OF_MESSAGES)
                .cloned()
                .unwrap_or_default()
        };
        if depth(&a) == "1" && depth(&b) == "2" {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(flushed, "timer should flush both queues");
    assert!(factory.buffer_factory().is_timer_running());
    factory.dispose().await.unwrap();
    assert!(!factory.buffer_factory().is_timer_running());
}

/// Verify that disposal drains sends, deletes and visibility changes, and
/// that rejected operations reach the error handler
#[tokio::test]
async fn test_dispose_loses_no_operation() {
    let failures = FailureLog::default();
    let (factory, _remote) = recording_factory(&manual_flush_settings(), Some(failures.handler()));
    let client = factory.create_client();
    let queue = QueueName::new("drain").unwrap();

    for i in 0..6 {
        client
            .publish_to(&queue, Message::new(format!("first-{}", i)))
            .await
            .unwrap();
    }
    factory.flush().await;

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(
            client
                .get(&queue, Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap(),
        );
    }

    // 4 sends, 4 deletes (one with a stale receipt) and 2 visibility changes.
    for i in 0..4 {
        assert!(!client
            .publish_to(&queue, Message::new(format!("second-{}", i)))
            .await
            .unwrap());
    }
    for message in &received[..3] {
        assert!(!client.ack(message).await.unwrap());
    }
    let mut stale = received[3].clone();
    stale.receipt_handle = ReceiptHandle::new("stale-receipt");
    assert!(!client.ack(&stale).await.unwrap());
    for message in &received[3..] {
        assert!(!client.change_visibility(message, 0).await.unwrap());
    }

    factory.dispose().await.unwrap();

    // 6 - 3 acknowledged + 4 new; the cached sixth message was released too.
    assert_eq!(message_counts(&factory, &queue).await, (7, 0));
    let failures = failures.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].operation, BufferedOperation::Delete);
    assert_eq!(failures[0].queue_name, queue);
    assert_eq!(failures[0].error.code, "ReceiptHandleIsInvalid");
}

/// Verify that a flush interval change takes effect without losing work
#[tokio::test]
async fn test_flush_interval_can_be_changed_at_runtime() {
    let (factory, _remote) = recording_factory(&manual_flush_settings(), None);
    let client = factory.create_client();
    let queue = QueueName::new("late-timer").unwrap();
    client.publish_to(&queue, Message::new("waiting")).await.unwrap();
    assert!(!factory.buffer_factory().is_timer_running());

    factory
        .buffer_factory()
        .set_flush_interval(Duration::from_millis(20))
        .await;

    let url = factory.queue_manager().get_queue_url(&queue, false).await.unwrap();
    let remote = factory.queue_manager().client().clone();
    let delivered = {
        let mut delivered = false;
        for _ in 0..100 {
            let attrs = remote.get_queue_attributes(&url).await.unwrap();
            if attrs.get(attributes::APPROXIMATE_NUMBER_OF_MESSAGES).map(String::as_str) == Some("1")
            {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        delivered
    };
    assert!(delivered);
    assert!(wait_until(Duration::from_secs(1), || factory.buffer_factory().is_timer_running()).await);
}
