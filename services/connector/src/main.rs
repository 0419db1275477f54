// connector: bidirectional bridge between a local line socket and a remote
// pub/sub bus. Wires together the RetryStore, Forwarder, SessionManager and
// endpoint adapters for both directions and runs until killed.

use bridge_protocol::capability::{
    BackpressureSink, BoxFuture, BusSubscriber, Delivery, DeliveryTag, PublishOutcome, TransportError,
};
use bridge_protocol::wire::WireForm;
use connector::endpoints::bus::{BusPublisherAdapter, BusSubscriberAdapter, PublicationMap, RawBusTransport};
use connector::endpoints::line_socket::{LineSocketClient, LineSocketServer};
use connector::forwarder::{Forwarder, ForwarderConfig};
use connector::session::{effective_max_in_flight, SessionManager};
use connector::status_http::{StatusConfig, StatusServer};
use connector::storage::retry_store::RetryStore;
use connector::{config, status_http};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stand-in for the real XMPP/AMQP driver (spec.md §1 — the transport
/// driver is explicitly out of scope; only its interface is specified).
/// Always reports disconnected, so until a real driver is wired in, the
/// socket→bus direction durably retries everything rather than dropping it.
struct UnimplementedBusTransport;

impl RawBusTransport for UnimplementedBusTransport {
    fn publish_raw(
        &self,
        _destination: &str,
        _routing_key: &str,
        _payload: Vec<u8>,
        _persistent: bool,
    ) -> BoxFuture<'_, Result<PublishOutcome, TransportError>> {
        Box::pin(async { Err(TransportError("no bus transport driver configured".to_owned())) })
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Stand-in for the real XMPP/AMQP receive side (spec.md §1). `recv` always
/// fails, so `BusSubscriberAdapter` spins on its retry backoff rather than
/// ever delivering anything, until a real driver replaces it.
struct UnimplementedBusSubscriber;

impl BusSubscriber for UnimplementedBusSubscriber {
    fn recv(&self) -> BoxFuture<'_, Result<Delivery, TransportError>> {
        Box::pin(async { Err(TransportError("no bus subscriber driver configured".to_owned())) })
    }

    fn ack(&self, _tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn nack(&self, _tag: DeliveryTag) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Stand-in backpressure target for the bus subscription feeding the
/// bus→socket direction, until a real `BusSubscriber` is wired in.
struct NoopBackpressureSink;

impl BackpressureSink for NoopBackpressureSink {
    fn pause(&self) {
        warn!("bus→socket queue full but no bus subscriber is wired in to pause");
    }
    fn resume(&self) {}
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "connector starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "fatal: failed to load config");
            std::process::exit(1);
        }
    };

    let retry_to_bus = match RetryStore::open(Path::new(&cfg.connector.backup_file), &cfg.connector.backup_table_to_bus) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "fatal: failed to open retry store for socket→bus direction");
            std::process::exit(1);
        }
    };
    let retry_from_bus = match RetryStore::open(Path::new(&cfg.connector.backup_file), &cfg.connector.backup_table_from_bus) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "fatal: failed to open retry store for bus→socket direction");
            std::process::exit(1);
        }
    };

    let max_in_flight = effective_max_in_flight(cfg.bus.max_send_simult);

    // Socket→Bus direction: line server source, bus publisher sink.
    let bus_transport = Arc::new(UnimplementedBusTransport);
    let publications = PublicationMap::new(cfg.publications.clone());
    let bus_publisher = Arc::new(BusPublisherAdapter::new(bus_transport, publications));
    let to_bus_forwarder = Forwarder::new(
        retry_to_bus,
        bus_publisher,
        ForwarderConfig {
            max_in_flight,
            batch_size: cfg.bus.batch_send_perf,
            q_max: cfg.connector.max_queue_size,
            wire_form: WireForm::Amqp,
        },
    );
    let line_server = LineSocketServer::new();
    let to_bus_session = SessionManager::new(to_bus_forwarder, line_server.clone());

    // Bus→Socket direction: bus subscriber source, line client sink.
    let line_client = LineSocketClient::new(cfg.connector.socket_recv.clone());
    let from_bus_forwarder = Forwarder::new(
        retry_from_bus,
        line_client.clone(),
        ForwarderConfig {
            max_in_flight,
            batch_size: 1,
            q_max: cfg.connector.max_queue_size,
            wire_form: WireForm::Line,
        },
    );
    let from_bus_session = SessionManager::new(from_bus_forwarder, Arc::new(NoopBackpressureSink));

    to_bus_session.start();
    from_bus_session.start();
    line_client.start_reconnect_loop();

    let ingest_session = to_bus_session.clone();
    let ingest: Arc<dyn Fn(bridge_protocol::message::Message) + Send + Sync> =
        Arc::new(move |msg| ingest_session.ingest(msg));
    let socket_send_path = cfg.connector.socket_send.clone();
    let server_for_task = line_server.clone();
    tokio::spawn(async move {
        if let Err(e) = server_for_task.serve(&socket_send_path, ingest).await {
            error!(error = %e, "line socket server exited");
        }
    });

    let bus_subscriber = Arc::new(UnimplementedBusSubscriber);
    let subscriber_adapter = Arc::new(BusSubscriberAdapter::new(bus_subscriber));
    let from_bus_ingest_session = from_bus_session.clone();
    let from_bus_ingest: Arc<dyn Fn(bridge_protocol::message::Message) + Send + Sync> =
        Arc::new(move |msg| from_bus_ingest_session.ingest(msg));
    tokio::spawn(subscriber_adapter.run(from_bus_ingest));

    let status_cfg = StatusConfig {
        bind: "0.0.0.0:8080".to_owned(),
        connector_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    let to_bus_stats: Arc<dyn status_http::StatsSource> = to_bus_session;
    let from_bus_stats: Arc<dyn status_http::StatsSource> = from_bus_session;
    match StatusServer::start(status_cfg, to_bus_stats, from_bus_stats).await {
        Ok(server) => info!(addr = %server.local_addr(), "status http server listening"),
        Err(e) => error!(error = %e, "fatal: status http server failed to start"),
    }

    std::future::pending::<()>().await;
}
