// Test doubles for the bus-facing capability traits. No real XMPP/AMQP
// transport exists in this workspace to mock against; these sit directly
// behind `BusPublisher`/`BusSubscriber` instead of a socket.

use bridge_protocol::capability::{
    BoxFuture, BusPublisher, BusSubscriber, Delivery, DeliveryTag, PublishOutcome, PublishRequest, TransportError,
};
use bridge_protocol::message::Message;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

/// An owned copy of a [`PublishRequest`], recorded for later inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    pub kind: String,
    pub routing_key: Option<String>,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub recipient: Option<String>,
}

impl From<PublishRequest> for RecordedPublish {
    fn from(req: PublishRequest) -> Self {
        RecordedPublish {
            kind: req.kind,
            routing_key: req.routing_key,
            payload: req.payload,
            persistent: req.persistent,
            recipient: req.recipient,
        }
    }
}

/// Records every message handed to `publish`, and can be told to reject
/// traffic as disconnected or to refuse specific messages.
pub struct MockBusPublisher {
    sent: Mutex<Vec<RecordedPublish>>,
    connected: AtomicBool,
    /// When set, the next `publish` call (and only that one) returns
    /// `PublishOutcome::Rejected` instead of `Ack`.
    reject_next: AtomicBool,
    /// When set, every `publish` call blocks until `release_held_publishes`
    /// is called, instead of resolving immediately. Lets a test pin a batch
    /// of publishes in flight to assert on `in_flight_count` (e.g. that it
    /// never exceeds a forwarder's `max_in_flight`).
    hold: AtomicBool,
    in_flight: AtomicU64,
    release: Notify,
}

impl MockBusPublisher {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            reject_next: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            release: Notify::new(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn reject_next_publish(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<RecordedPublish> {
        self.sent.lock().expect("mock publisher mutex poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock publisher mutex poisoned").len()
    }

    /// Hold every subsequent `publish` call open until `release_held_publishes`
    /// is called, so a test can observe how many are in flight at once.
    pub fn hold_publishes(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Let every currently-held (and any future) `publish` call complete.
    pub fn release_held_publishes(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Number of `publish` calls currently awaiting completion.
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockBusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPublisher for MockBusPublisher {
    fn publish(&self, req: PublishRequest) -> BoxFuture<'_, Result<Option<PublishOutcome>, TransportError>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError("mock publisher disconnected".to_owned()));
            }
            if self.reject_next.swap(false, Ordering::SeqCst) {
                return Ok(Some(PublishOutcome::Rejected));
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            while self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let is_push_only = req.kind == "oneToOne";
            self.sent
                .lock()
                .expect("mock publisher mutex poisoned")
                .push(RecordedPublish::from(req));
            if is_push_only {
                Ok(None)
            } else {
                Ok(Some(PublishOutcome::Ack))
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Delivers synthetic messages fed in by the test via `feed`, tagging each
/// with a monotonically increasing [`DeliveryTag`] and recording every
/// `ack`/`nack` call for inspection.
pub struct MockBusSubscriber {
    rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    tx: mpsc::UnboundedSender<Message>,
    next_tag: AtomicU64,
    acked: Mutex<Vec<DeliveryTag>>,
    nacked: Mutex<Vec<DeliveryTag>>,
}

impl MockBusSubscriber {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx: AsyncMutex::new(rx),
            tx,
            next_tag: AtomicU64::new(0),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
        }
    }

    pub fn feed(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    pub fn acked_tags(&self) -> Vec<DeliveryTag> {
        self.acked.lock().expect("mock subscriber mutex poisoned").clone()
    }

    pub fn nacked_tags(&self) -> Vec<DeliveryTag> {
        self.nacked.lock().expect("mock subscriber mutex poisoned").clone()
    }
}

impl Default for MockBusSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl BusSubscriber for MockBusSubscriber {
    fn recv(&self) -> BoxFuture<'_, Result<Delivery, TransportError>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            let message = rx
                .recv()
                .await
                .ok_or_else(|| TransportError("mock subscriber closed".to_owned()))?;
            let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
            Ok(Delivery { message, tag })
        })
    }

    fn ack(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.acked.lock().expect("mock subscriber mutex poisoned").push(tag);
            Ok(())
        })
    }

    fn nack(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.nacked.lock().expect("mock subscriber mutex poisoned").push(tag);
            Ok(())
        })
    }
}
