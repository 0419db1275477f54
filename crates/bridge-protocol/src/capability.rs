//! Capability traits the connector drives the bus and the local socket
//! through (spec.md §6, DESIGN NOTES §9).
//!
//! The actual transport (XMPP/AMQP wire driver, TCP/unix listener) is out of
//! scope; these traits are the seam a real driver plugs into, and
//! `bridge-test-utils` supplies a test double for everything in this
//! workspace.

use crate::message::Message;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// A future boxed for storage behind a trait object, since this workspace
/// does not depend on `async-trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Ack,
    /// The broker rejected the message as malformed; do not retry
    /// (spec.md §7, "not acceptable").
    Rejected,
}

/// Transport-level failure: the caller should treat the session as
/// disconnected and re-queue through the `RetryStore` (spec.md §7,
/// "transient transport error").
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// A publish request: the already-serialized wire form plus the routing
/// metadata the transport needs (spec.md §4.5,
/// "publish(kind, routingKey, payload, persistent)").
///
/// Owned rather than borrowed: a request is handed to `publish` and moved
/// into the resulting future, which may outlive the call site while it sits
/// in a `PendingReplies` set awaiting completion.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub kind: String,
    pub routing_key: Option<String>,
    pub payload: Vec<u8>,
    pub persistent: bool,
    /// Present only for `oneToOne`.
    pub recipient: Option<String>,
}

impl PublishRequest {
    /// Build a request from a pipeline [`Message`] and its emitted payload.
    pub fn from_message(msg: &Message, payload: Vec<u8>) -> Self {
        PublishRequest {
            kind: msg.kind.as_str().to_owned(),
            routing_key: msg.routing_key.clone(),
            payload,
            persistent: msg.persistent,
            recipient: msg.recipient.clone(),
        }
    }
}

/// Capability for sending messages to the remote bus.
///
/// `publish` returns `None` for fire-and-forget kinds (`oneToOne`,
/// spec.md §4.3 step 2c) and `Some(outcome)` otherwise. Returns immediate
/// failure if not connected (spec.md §4.5).
pub trait BusPublisher: Send + Sync {
    fn publish(&self, req: PublishRequest) -> BoxFuture<'_, Result<Option<PublishOutcome>, TransportError>>;

    fn is_connected(&self) -> bool;
}

/// Opaque handle a transport hands back with a [`Delivery`] so it can later
/// be acked or nacked. Transports with no delivery-acknowledgement concept
/// (XMPP chat) are free to ignore it; `ack`/`nack` are no-ops for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag(pub u64);

/// A message received from the bus, together with the tag needed to
/// ack/nack it (spec.md §4.5, "BusSubscriber").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    pub tag: DeliveryTag,
}

/// Capability for receiving messages from the remote bus.
///
/// Supports ack/nack for transports that require it, e.g. AMQP (spec.md
/// §4.5). For push-only transports (XMPP chat) delivery is fire-and-forget
/// and `ack`/`nack` are no-ops.
pub trait BusSubscriber: Send + Sync {
    fn recv(&self) -> BoxFuture<'_, Result<Delivery, TransportError>>;

    fn ack(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>>;

    fn nack(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Backpressure sink implemented by both `LineSocketServer` and the
/// connector's bus-facing subscriber path (spec.md §5, "Backpressure").
pub trait BackpressureSink: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}
