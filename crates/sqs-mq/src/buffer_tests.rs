//! Tests for client-side batching and the shared flush timer.

use super::*;
use crate::client::{ReceiveRequest, MAX_MESSAGE_SIZE};
use crate::providers::InMemorySqs;
use crate::queue_manager::{QueueManager, QueueOptions};

struct Fixture {
    client: Arc<dyn SqsClient>,
    manager: QueueManager,
    failures: Arc<Mutex<Vec<BufferedOperationError>>>,
}

impl Fixture {
    fn new() -> Self {
        let client: Arc<dyn SqsClient> = Arc::new(InMemorySqs::default());
        Self {
            manager: QueueManager::new(Arc::clone(&client)),
            client,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn error_handler(&self) -> BufferErrorHandler {
        let failures = Arc::clone(&self.failures);
        Arc::new(move |failure: &BufferedOperationError| {
            failures.lock().unwrap().push(failure.clone());
        })
    }

    async fn definition(&self, name: &str) -> Arc<QueueDefinition> {
        self.manager
            .create_queue(&QueueName::new(name).unwrap(), &QueueOptions::default())
            .await
            .unwrap()
    }

    async fn buffer(&self, name: &str) -> MessageBuffer {
        MessageBuffer::new(
            self.definition(name).await,
            Arc::clone(&self.client),
            Some(self.error_handler()),
        )
    }

    fn failures(&self) -> Vec<BufferedOperationError> {
        self.failures.lock().unwrap().clone()
    }

    async fn visible_count(&self, queue_url: &str) -> usize {
        let mut total = 0;
        loop {
            let batch = self
                .client
                .receive_messages(queue_url, &ReceiveRequest::new(10).with_visibility_timeout(300))
                .await
                .unwrap();
            if batch.is_empty() {
                return total;
            }
            total += batch.len();
        }
    }

    /// Put `count` messages on the queue and receive them all
    async fn received(&self, queue_url: &str, count: usize) -> Vec<ReceivedMessage> {
        for i in 0..count {
            self.client
                .send_message(queue_url, &Message::new(format!("m{}", i)))
                .await
                .unwrap();
        }
        let mut received = Vec::new();
        while received.len() < count {
            received.extend(
                self.client
                    .receive_messages(queue_url, &ReceiveRequest::new(10))
                    .await
                    .unwrap(),
            );
        }
        received
    }
}

mod sends {
    use super::*;

    #[tokio::test]
    async fn test_send_below_threshold_is_buffered() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_send_buffer_size(3);

        assert!(!buffer.send(Message::new("1")).await.unwrap());
        assert!(!buffer.send(Message::new("2")).await.unwrap());
        assert_eq!(buffer.pending_send_count(), 2);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 0);

        assert!(buffer.send(Message::new("3")).await.unwrap());
        assert_eq!(buffer.pending_send_count(), 0);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 3);
    }

    #[tokio::test]
    async fn test_disabled_buffering_sends_immediately() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_disable_buffering(true);

        assert!(buffer.send(Message::new("now")).await.unwrap());
        assert_eq!(buffer.pending_send_count(), 0);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 1);
    }

    #[tokio::test]
    async fn test_threshold_of_one_sends_immediately() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_send_buffer_size(1);

        assert!(buffer.send(Message::new("now")).await.unwrap());
        assert_eq!(buffer.pending_send_count(), 0);
    }

    /// Lowering the threshold applies to messages already pending.
    #[tokio::test]
    async fn test_threshold_change_applies_to_pending_list() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;

        assert!(!buffer.send(Message::new("1")).await.unwrap());
        buffer.definition().buffering.set_send_buffer_size(2);

        assert!(buffer.send(Message::new("2")).await.unwrap());
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 2);
    }

    #[tokio::test]
    async fn test_rejected_items_go_to_error_handler() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_send_buffer_size(2);
        let oversized = Message::new(vec![b'x'; MAX_MESSAGE_SIZE + 1]);

        assert!(!buffer.send(oversized).await.unwrap());
        assert!(buffer.send(Message::new("fine")).await.unwrap());

        let failures = fixture.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, BufferedOperation::Send);
        assert_eq!(failures[0].error.code, "MessageTooLong");
        assert_eq!(failures[0].queue_name.as_str(), "orders");
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 1);
    }

    #[tokio::test]
    async fn test_triggering_item_failure_returns_false() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_send_buffer_size(2);

        assert!(!buffer.send(Message::new("fine")).await.unwrap());
        let oversized = Message::new(vec![b'x'; MAX_MESSAGE_SIZE + 1]);
        assert!(!buffer.send(oversized).await.unwrap());

        assert_eq!(fixture.failures().len(), 1);
        assert_eq!(buffer.pending_send_count(), 0);
    }

    /// A whole-batch failure surfaces to the caller and every carried item
    /// reaches the error handler.
    #[tokio::test]
    async fn test_hard_failure_propagates_and_reports_every_item() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_send_buffer_size(3);
        fixture.client.delete_queue(buffer.queue_url()).await.unwrap();

        buffer.send(Message::new("1")).await.unwrap();
        buffer.send(Message::new("2")).await.unwrap();
        let result = buffer.send(Message::new("3")).await;

        assert!(matches!(result, Err(QueueError::QueueNotFound { .. })));
        let failures = fixture.failures();
        assert_eq!(failures.len(), 3);
        assert!(failures
            .iter()
            .all(|f| f.error.code == "QueueDoesNotExist" && f.operation == BufferedOperation::Send));
    }

    #[tokio::test]
    async fn test_failures_without_handler_are_not_fatal() {
        let fixture = Fixture::new();
        let buffer = MessageBuffer::new(
            fixture.definition("orders").await,
            Arc::clone(&fixture.client),
            None,
        );
        buffer.definition().buffering.set_send_buffer_size(2);

        buffer
            .send(Message::new(vec![b'x'; MAX_MESSAGE_SIZE + 1]))
            .await
            .unwrap();
        assert!(buffer.send(Message::new("fine")).await.unwrap());
    }
}

mod deletes_and_visibility {
    use super::*;

    #[tokio::test]
    async fn test_deletes_flush_at_threshold() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_delete_buffer_size(2);
        let received = fixture.received(buffer.queue_url(), 2).await;

        assert!(!buffer
            .delete(received[0].receipt_handle.clone())
            .await
            .unwrap());
        assert_eq!(buffer.pending_delete_count(), 1);
        assert!(buffer
            .delete(received[1].receipt_handle.clone())
            .await
            .unwrap());
        assert_eq!(buffer.pending_delete_count(), 0);

        let attrs = fixture
            .client
            .get_queue_attributes(buffer.queue_url())
            .await
            .unwrap();
        assert_eq!(
            attrs.get(crate::client::attributes::APPROXIMATE_NUMBER_OF_MESSAGES_NOT_VISIBLE)
                .map(String::as_str),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_invalid_receipt_is_reported_per_item() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_delete_buffer_size(2);
        let received = fixture.received(buffer.queue_url(), 1).await;

        buffer
            .delete(ReceiptHandle::new("not-a-receipt"))
            .await
            .unwrap();
        assert!(buffer
            .delete(received[0].receipt_handle.clone())
            .await
            .unwrap());

        let failures = fixture.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, BufferedOperation::Delete);
        assert_eq!(failures[0].error.code, "ReceiptHandleIsInvalid");
    }

    #[tokio::test]
    async fn test_visibility_change_to_zero_requeues() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer
            .definition()
            .buffering
            .set_change_visibility_buffer_size(1);
        let received = fixture.received(buffer.queue_url(), 1).await;

        assert!(buffer
            .change_visibility(received[0].receipt_handle.clone(), 0)
            .await
            .unwrap());
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 1);
    }
}

mod receives {
    use super::*;

    #[tokio::test]
    async fn test_receive_caches_surplus_messages() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_receive_buffer_size(5);
        for i in 0..5 {
            fixture
                .client
                .send_message(buffer.queue_url(), &Message::new(format!("m{}", i)))
                .await
                .unwrap();
        }

        let first = buffer.receive(0).await.unwrap();
        assert!(first.is_some());
        assert_eq!(buffer.cached_receive_count(), 4);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 0);

        for _ in 0..4 {
            assert!(buffer.receive(0).await.unwrap().is_some());
        }
        assert_eq!(buffer.cached_receive_count(), 0);
        assert!(buffer.receive(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_buffering_receives_one_at_a_time() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.definition().buffering.set_disable_buffering(true);
        for body in ["a", "b"] {
            fixture
                .client
                .send_message(buffer.queue_url(), &Message::new(body))
                .await
                .unwrap();
        }

        assert!(buffer.receive(0).await.unwrap().is_some());
        assert_eq!(buffer.cached_receive_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_releases_cached_messages() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        for i in 0..3 {
            fixture
                .client
                .send_message(buffer.queue_url(), &Message::new(format!("m{}", i)))
                .await
                .unwrap();
        }
        buffer.receive(0).await.unwrap().unwrap();
        assert_eq!(buffer.cached_receive_count(), 2);

        buffer.dispose().await.unwrap();

        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 2);
    }
}

mod lifecycle {
    use super::*;

    /// Every pending operation is either applied or reported when the
    /// buffer is disposed.
    #[tokio::test]
    async fn test_dispose_drains_every_pending_list() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        let received = fixture.received(buffer.queue_url(), 5).await;

        for i in 0..4 {
            buffer.send(Message::new(format!("new{}", i))).await.unwrap();
        }
        for message in &received[..3] {
            buffer.delete(message.receipt_handle.clone()).await.unwrap();
        }
        for message in &received[3..] {
            buffer
                .change_visibility(message.receipt_handle.clone(), 0)
                .await
                .unwrap();
        }
        assert_eq!(buffer.pending_send_count(), 4);
        assert_eq!(buffer.pending_delete_count(), 3);
        assert_eq!(buffer.pending_change_visibility_count(), 2);

        buffer.dispose().await.unwrap();

        assert_eq!(buffer.pending_send_count(), 0);
        assert_eq!(buffer.pending_delete_count(), 0);
        assert_eq!(buffer.pending_change_visibility_count(), 0);
        assert!(fixture.failures().is_empty());
        // Four new messages plus the two made visible again.
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 6);
    }

    #[tokio::test]
    async fn test_flush_sends_remainder_below_threshold() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        let total = MAX_BATCH_SIZE * 2 + 3;

        for i in 0..total {
            buffer.send(Message::new(format!("m{}", i))).await.unwrap();
        }
        assert_eq!(buffer.pending_send_count(), 3);

        buffer.flush().await.unwrap();

        assert_eq!(buffer.pending_send_count(), 0);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, total);
    }

    #[tokio::test]
    async fn test_operations_after_dispose_are_rejected() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer("orders").await;
        buffer.dispose().await.unwrap();

        assert!(buffer.is_disposed());
        assert!(matches!(
            buffer.send(Message::new("late")).await,
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            buffer.receive(0).await,
            Err(QueueError::InvalidState { .. })
        ));
        // Disposing twice is harmless.
        buffer.dispose().await.unwrap();
    }
}

mod factory {
    use super::*;

    fn factory(fixture: &Fixture, interval: Duration) -> BufferFactory {
        BufferFactory::new(
            Arc::clone(&fixture.client),
            Some(fixture.error_handler()),
            interval,
        )
    }

    #[tokio::test]
    async fn test_one_buffer_per_queue() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::ZERO);
        let definition = fixture.definition("orders").await;

        let first = factory.get_or_create_buffer(Arc::clone(&definition));
        let second = factory.get_or_create_buffer(definition);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.live_buffer_count(), 1);
        assert!(!factory.is_timer_running());
    }

    #[tokio::test]
    async fn test_registry_does_not_keep_buffers_alive() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::ZERO);

        let buffer = factory.get_or_create_buffer(fixture.definition("orders").await);
        drop(buffer);

        assert_eq!(factory.live_buffer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_below_threshold() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::from_millis(500));
        let buffer = factory.get_or_create_buffer(fixture.definition("orders").await);

        buffer.send(Message::new("lonely")).await.unwrap();
        assert!(factory.is_timer_running());
        assert_eq!(buffer.pending_send_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(buffer.pending_send_count(), 0);
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 1);
    }

    /// Turning the timer off still flushes what is pending one last time.
    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_flushes_once_then_stops() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::from_secs(60));
        let buffer = factory.get_or_create_buffer(fixture.definition("orders").await);
        buffer.send(Message::new("pending")).await.unwrap();

        factory.set_flush_interval(Duration::ZERO).await;

        assert!(!factory.is_timer_running());
        assert_eq!(buffer.pending_send_count(), 0);

        buffer.send(Message::new("later")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(buffer.pending_send_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_flushes_and_disposes_live_buffers() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::from_secs(60));
        let buffer = factory.get_or_create_buffer(fixture.definition("orders").await);
        buffer.send(Message::new("pending")).await.unwrap();

        factory.dispose().await.unwrap();

        assert!(buffer.is_disposed());
        assert!(!factory.is_timer_running());
        assert_eq!(fixture.visible_count(buffer.queue_url()).await, 1);
    }

    #[tokio::test]
    async fn test_disposed_buffer_is_replaced() {
        let fixture = Fixture::new();
        let factory = factory(&fixture, Duration::ZERO);
        let definition = fixture.definition("orders").await;

        let first = factory.get_or_create_buffer(Arc::clone(&definition));
        first.dispose().await.unwrap();
        let second = factory.get_or_create_buffer(definition);

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_disposed());
    }
}
