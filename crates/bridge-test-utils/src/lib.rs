// bridge-test-utils: shared test doubles for the connector's integration
// suite.
//
// The real bus transport (XMPP/AMQP driver) is out of scope for this
// workspace, so there is nothing to spin up a fake server for; instead these
// types sit directly behind the `BusPublisher`/`BusSubscriber` capability
// traits and let tests observe/drive them in-process.

pub mod mock_bus;

pub use mock_bus::{MockBusPublisher, MockBusSubscriber, RecordedPublish};

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::capability::{BusPublisher, BusSubscriber, DeliveryTag, PublishOutcome, PublishRequest};
    use bridge_protocol::message::{Kind, Message, MessageBody};

    fn sample_perf() -> Message {
        Message {
            kind: Kind::Perf,
            routing_key: None,
            persistent: true,
            recipient: None,
            body: MessageBody::Perf {
                timestamp: "2026-07-28T10:00:00".to_owned(),
                host: "host1".to_owned(),
                datasource: "load".to_owned(),
                value: "0.1".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn publisher_records_sent_messages() {
        let publisher = MockBusPublisher::new();
        let msg = sample_perf();
        let req = PublishRequest::from_message(&msg, b"payload".to_vec());
        let outcome = publisher.publish(req).await.unwrap();
        assert_eq!(outcome, Some(PublishOutcome::Ack));
        assert_eq!(publisher.sent_count(), 1);
    }

    #[tokio::test]
    async fn publisher_errors_when_disconnected() {
        let publisher = MockBusPublisher::new();
        publisher.set_connected(false);
        let msg = sample_perf();
        let req = PublishRequest::from_message(&msg, b"payload".to_vec());
        assert!(publisher.publish(req).await.is_err());
        assert_eq!(publisher.sent_count(), 0);
    }

    #[tokio::test]
    async fn publisher_can_be_told_to_reject_next_publish() {
        let publisher = MockBusPublisher::new();
        publisher.reject_next_publish();
        let msg = sample_perf();
        let req = PublishRequest::from_message(&msg, b"payload".to_vec());
        let outcome = publisher.publish(req).await.unwrap();
        assert_eq!(outcome, Some(PublishOutcome::Rejected));
        // rejection doesn't count as sent, and only applies once
        assert_eq!(publisher.sent_count(), 0);
        let req2 = PublishRequest::from_message(&msg, b"payload".to_vec());
        let outcome2 = publisher.publish(req2).await.unwrap();
        assert_eq!(outcome2, Some(PublishOutcome::Ack));
    }

    #[tokio::test]
    async fn one_to_one_publish_returns_no_outcome() {
        let publisher = MockBusPublisher::new();
        let inner = sample_perf();
        let msg = Message {
            kind: Kind::OneToOne,
            routing_key: None,
            persistent: true,
            recipient: Some("peer@bus.example".to_owned()),
            body: MessageBody::Nested(Box::new(inner)),
        };
        let req = PublishRequest::from_message(&msg, b"payload".to_vec());
        let outcome = publisher.publish(req).await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn subscriber_delivers_fed_messages_in_order() {
        let subscriber = MockBusSubscriber::new();
        subscriber.feed(sample_perf());
        let delivery = subscriber.recv().await.unwrap();
        assert_eq!(delivery.message.kind, Kind::Perf);
        assert_eq!(delivery.tag, DeliveryTag(0));
    }

    #[tokio::test]
    async fn subscriber_tags_are_monotonic_and_ack_nack_are_recorded() {
        let subscriber = MockBusSubscriber::new();
        subscriber.feed(sample_perf());
        subscriber.feed(sample_perf());
        let first = subscriber.recv().await.unwrap();
        let second = subscriber.recv().await.unwrap();
        assert_eq!(first.tag, DeliveryTag(0));
        assert_eq!(second.tag, DeliveryTag(1));

        subscriber.ack(first.tag).await.unwrap();
        subscriber.nack(second.tag).await.unwrap();
        assert_eq!(subscriber.acked_tags(), vec![DeliveryTag(0)]);
        assert_eq!(subscriber.nacked_tags(), vec![DeliveryTag(1)]);
    }

    #[tokio::test]
    async fn publisher_hold_caps_concurrency_until_released() {
        use std::sync::Arc;

        let publisher = Arc::new(MockBusPublisher::new());
        publisher.hold_publishes();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let publisher = Arc::clone(&publisher);
            let msg = sample_perf();
            handles.push(tokio::spawn(async move {
                let req = PublishRequest::from_message(&msg, b"payload".to_vec());
                publisher.publish(req).await
            }));
        }

        // give both spawned publishes a chance to register as held.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(publisher.in_flight_count(), 2);

        publisher.release_held_publishes();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(publisher.sent_count(), 2);
    }
}
