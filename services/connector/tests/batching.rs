//! Integration tests for `perf` batching into `perfs` (spec.md §4.3).

use bridge_protocol::message::{Kind, Message, MessageBody};
use bridge_protocol::wire::WireForm;
use bridge_test_utils::MockBusPublisher;
use connector::forwarder::{Forwarder, ForwarderConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn perf(tag: &str) -> Message {
    Message {
        kind: Kind::Perf,
        routing_key: None,
        persistent: true,
        recipient: None,
        body: MessageBody::Perf {
            timestamp: tag.to_owned(),
            host: "host1".to_owned(),
            datasource: "load".to_owned(),
            value: "0.2".to_owned(),
        },
    }
}

fn non_batch_eligible(tag: &str) -> Message {
    Message {
        kind: Kind::Event,
        routing_key: None,
        persistent: true,
        recipient: None,
        body: MessageBody::Event {
            timestamp: tag.to_owned(),
            host: "host1".to_owned(),
            service: "monitor".to_owned(),
            state: "CRITICAL".to_owned(),
            message: "something happened".to_owned(),
        },
    }
}

#[tokio::test]
async fn perf_messages_accumulate_until_batch_size_then_send_as_one_perfs() {
    let file = NamedTempFile::new().unwrap();
    let retry = connector::storage::retry_store::RetryStore::open(file.path(), "retry_to_bus").unwrap();
    let publisher = Arc::new(MockBusPublisher::new());
    let cfg = ForwarderConfig { max_in_flight: 100, batch_size: 4, q_max: 0, wire_form: WireForm::Amqp };
    let fwd = Forwarder::new(retry, publisher.clone(), cfg);
    fwd.on_connected();
    fwd.start();

    for tag in ["a", "b", "c"] {
        fwd.ingest(perf(tag));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fwd.stats().sent, 0, "batch of 4 not yet full after 3 perfs");

    fwd.ingest(perf("d"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fwd.stats().sent, 1, "exactly one aggregate publish for the full batch");
    assert_eq!(publisher.sent_count(), 1);

    fwd.stop();
}

#[tokio::test]
async fn non_batch_eligible_kinds_are_never_held_for_batching() {
    let file = NamedTempFile::new().unwrap();
    let retry = connector::storage::retry_store::RetryStore::open(file.path(), "retry_to_bus").unwrap();
    let publisher = Arc::new(MockBusPublisher::new());
    let cfg = ForwarderConfig { max_in_flight: 100, batch_size: 10, q_max: 0, wire_form: WireForm::Amqp };
    let fwd = Forwarder::new(retry, publisher.clone(), cfg);
    fwd.on_connected();
    fwd.start();

    fwd.ingest(non_batch_eligible("e1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fwd.stats().sent, 1, "events are sent individually, not batched");

    fwd.stop();
}

#[tokio::test]
async fn stop_flushes_a_partial_batch_to_the_retry_store_instead_of_dropping_it() {
    let file = NamedTempFile::new().unwrap();
    let retry = connector::storage::retry_store::RetryStore::open(file.path(), "retry_to_bus").unwrap();
    let publisher = Arc::new(MockBusPublisher::new());
    let cfg = ForwarderConfig { max_in_flight: 100, batch_size: 5, q_max: 0, wire_form: WireForm::Amqp };
    let fwd = Forwarder::new(retry, publisher, cfg);

    fwd.ingest(perf("x"));
    fwd.ingest(perf("y"));
    fwd.stop();

    assert_eq!(fwd.stats().retry_size, 2, "partial batch members land in the retry store individually");
}
