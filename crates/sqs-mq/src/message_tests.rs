//! Tests for message types.

use super::*;

mod queue_names {
    use super::*;

    #[test]
    fn test_invalid_characters_are_replaced() {
        assert_eq!(to_valid_queue_name("mq:Incr.inq"), "mq-Incr-inq");
        assert_eq!(to_valid_queue_name("my queue"), "my-queue");
        assert_eq!(to_valid_queue_name("a.b:c d"), "a-b-c-d");
    }

    #[test]
    fn test_valid_names_are_unchanged() {
        for name in ["orders", "orders-inq", "orders_2", "A-b_C"] {
            assert_eq!(to_valid_queue_name(name), name);
        }
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for name in ["mq:tmp:abc.inq", "x.y.z", "a b:c", "plain"] {
            let once = to_valid_queue_name(name);
            let twice = to_valid_queue_name(&once);
            assert_eq!(once, twice, "normalizing '{}' twice changed it", name);
        }
    }

    #[test]
    fn test_queue_name_normalizes_on_construction() {
        let name = QueueName::new("mq:Greet.inq").unwrap();
        assert_eq!(name.as_str(), "mq-Greet-inq");
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(QueueName::new("test-queue").is_ok());
        assert!(QueueName::new("queue_123").is_ok());
        assert!(QueueName::new("a").is_ok());

        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("a".repeat(81)).is_err());
        assert!(QueueName::new("special@chars").is_err());
        assert!(QueueName::new("slash/name").is_err());
    }

    #[test]
    fn test_queue_name_from_url() {
        let name =
            QueueName::from_queue_url("http://localhost:4566/000000000000/orders-inq").unwrap();
        assert_eq!(name.as_str(), "orders-inq");
    }

    #[test]
    fn test_queue_name_serde_round_trip_normalizes() {
        let name: QueueName = serde_json::from_str("\"mq:Ping.outq\"").unwrap();
        assert_eq!(name.as_str(), "mq-Ping-outq");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"mq-Ping-outq\"");
    }

    #[test]
    fn test_type_queue_names() {
        let names = QueueNames::default();
        assert_eq!(names.in_queue("Incr").unwrap().as_str(), "mq-Incr-inq");
        assert_eq!(names.out_queue("Incr").unwrap().as_str(), "mq-Incr-outq");
        assert_eq!(
            names.dead_letter_queue("My.App.Incr").unwrap().as_str(),
            "mq-My-App-Incr-dlq"
        );

        let custom = QueueNames::new("tenant1");
        assert_eq!(custom.in_queue("Incr").unwrap().as_str(), "tenant1-Incr-inq");
    }

    #[test]
    fn test_temp_queue_names_are_unique_and_temporary() {
        let names = QueueNames::default();
        let a = names.temp_queue();
        let b = names.temp_queue();

        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(a.as_str().len() <= MAX_QUEUE_NAME_LENGTH);
        assert!(!names.in_queue("Incr").unwrap().is_temporary());
    }
}

mod messages {
    use super::*;

    #[test]
    fn test_message_builder() {
        let reply_to = QueueName::new("replies").unwrap();
        let message = Message::new("test body")
            .with_attribute("key", "value")
            .with_reply_to(reply_to.clone())
            .with_meta("trace", "t-1");

        assert_eq!(message.body_str(), Some("test body"));
        assert_eq!(message.attributes.get("key"), Some(&"value".to_string()));
        assert_eq!(message.reply_to, Some(reply_to));
        assert_eq!(message.meta.get("trace"), Some(&"t-1".to_string()));
    }

    #[test]
    fn test_received_message_to_message() {
        let received = ReceivedMessage {
            message_id: MessageId::new(),
            queue_url: "memory://queue".to_string(),
            receipt_handle: ReceiptHandle::new("receipt"),
            body: "payload".into(),
            attributes: HashMap::from([("a".to_string(), "1".to_string())]),
            reply_to: Some(QueueName::new("back").unwrap()),
            meta: HashMap::new(),
            receive_count: 2,
            sent_at: Timestamp::now(),
        };

        let message = received.message();
        assert_eq!(message.body, received.body);
        assert_eq!(message.reply_to, received.reply_to);
        assert_eq!(message.attributes.get("a"), Some(&"1".to_string()));

        assert!(received.has_exceeded_receive_count(1));
        assert!(!received.has_exceeded_receive_count(2));
    }

    #[test]
    fn test_message_serialization_encodes_body() {
        let message = Message::new(vec![0u8, 159, 146, 150]);
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back, message);
        assert_eq!(back.body_str(), None);
    }
}

mod timestamps {
    use super::*;

    #[test]
    fn test_epoch_seconds() {
        let ts = Timestamp::from_epoch_seconds(1_700_000_000).unwrap();
        assert_eq!(ts.epoch_seconds(), 1_700_000_000);
    }

    #[test]
    fn test_message_id_generation() {
        let id1 = MessageId::new();
        let id2 = MessageId::new();
        assert_ne!(id1, id2);
        assert!("".parse::<MessageId>().is_err());
    }
}
