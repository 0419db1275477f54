//! Bus-side routing resolution and the adapter seam a real XMPP/AMQP driver
//! plugs into (spec.md §4.5, §6). The transport driver itself — the XMPP
//! stream or AMQP channel, its auth, TLS, and reconnect/backoff policy — is
//! explicitly out of scope (spec.md §1); only the interface it must satisfy
//! is specified here.

use bridge_protocol::capability::{BoxFuture, BusPublisher, BusSubscriber, PublishOutcome, PublishRequest, TransportError};
use bridge_protocol::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Resolves a message kind to its destination node (XMPP) or exchange
/// (AMQP), per the `[publications]` config table (spec.md §6). Kinds with
/// no configured override publish to a node/exchange named after the kind
/// itself.
#[derive(Debug, Clone)]
pub struct PublicationMap(HashMap<String, String>);

impl PublicationMap {
    pub fn new(table: HashMap<String, String>) -> Self {
        PublicationMap(table)
    }

    pub fn resolve<'a>(&'a self, kind: &'a str) -> &'a str {
        self.0.get(kind).map(String::as_str).unwrap_or(kind)
    }
}

/// The transport-specific half of a publish: an already-connected driver
/// that pushes raw bytes to a (destination, routing key) pair and reports
/// completion. The real XMPP/PubSub stream or AMQP channel implements this;
/// everything above the seam (routing, retry, batching) stays
/// transport-agnostic.
pub trait RawBusTransport: Send + Sync {
    fn publish_raw(
        &self,
        destination: &str,
        routing_key: &str,
        payload: Vec<u8>,
        persistent: bool,
    ) -> BoxFuture<'_, Result<PublishOutcome, TransportError>>;

    fn is_connected(&self) -> bool;
}

/// Adapts a [`RawBusTransport`] plus a [`PublicationMap`] into the
/// `BusPublisher` capability the `Forwarder` drives (spec.md §4.5,
/// "BusPublisher").
pub struct BusPublisherAdapter<T: RawBusTransport> {
    transport: Arc<T>,
    publications: PublicationMap,
}

impl<T: RawBusTransport> BusPublisherAdapter<T> {
    pub fn new(transport: Arc<T>, publications: PublicationMap) -> Self {
        BusPublisherAdapter { transport, publications }
    }
}

impl<T: RawBusTransport + 'static> BusPublisher for BusPublisherAdapter<T> {
    fn publish(&self, req: PublishRequest) -> BoxFuture<'_, Result<Option<PublishOutcome>, TransportError>> {
        Box::pin(async move {
            if !self.transport.is_connected() {
                return Err(TransportError("bus transport not connected".to_owned()));
            }

            // oneToOne is push-only: addressed to the recipient directly,
            // and the caller never tracks a completion for it (spec.md
            // §4.3 step 2c).
            if req.kind == "oneToOne" {
                let recipient = req.recipient.clone().unwrap_or_default();
                self.transport.publish_raw(&recipient, &recipient, req.payload, req.persistent).await?;
                return Ok(None);
            }

            let destination = self.publications.resolve(&req.kind).to_owned();
            let routing_key = req.routing_key.clone().unwrap_or_else(|| req.kind.clone());
            let outcome = self
                .transport
                .publish_raw(&destination, &routing_key, req.payload, req.persistent)
                .await?;
            Ok(Some(outcome))
        })
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

/// Callback the adapter hands each delivered [`Message`] to, normally
/// `SessionManager::ingest` (mirrors `line_socket::Ingest`).
type Ingest = dyn Fn(Message) + Send + Sync;

/// Backoff applied between `recv` attempts after a transport error, so a
/// persistently failing subscriber doesn't spin (spec.md §4.5).
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Drives a [`BusSubscriber`] into an ingest callback (spec.md §4.5,
/// "BusSubscriber: adapter delivering incoming messages into
/// `Forwarder.ingest`. Supports ack/nack..."). Mirrors `BusPublisherAdapter`
/// for the opposite direction: the transport-specific receive/ack/nack live
/// behind the capability trait, this loop is the in-scope glue.
pub struct BusSubscriberAdapter<S: BusSubscriber> {
    subscriber: Arc<S>,
}

impl<S: BusSubscriber + 'static> BusSubscriberAdapter<S> {
    pub fn new(subscriber: Arc<S>) -> Self {
        BusSubscriberAdapter { subscriber }
    }

    /// Runs forever; callers normally `tokio::spawn` this. A `recv` error
    /// is logged and retried after a backoff rather than ending the loop —
    /// there's no way to distinguish a transient transport hiccup from the
    /// subscriber being gone for good, so this keeps trying.
    pub async fn run(self: Arc<Self>, ingest: Arc<Ingest>) {
        loop {
            match self.subscriber.recv().await {
                Ok(delivery) => {
                    ingest(delivery.message);
                    if let Err(TransportError(reason)) = self.subscriber.ack(delivery.tag).await {
                        warn!(error = %reason, "bus subscriber ack failed");
                    }
                }
                Err(TransportError(reason)) => {
                    warn!(error = %reason, "bus subscriber recv failed; retrying");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
