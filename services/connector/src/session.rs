//! Bus session state machine: connect/disconnect transitions and
//! backpressure hysteresis (spec.md §4.4).
//!
//! Wraps a `Forwarder`, owning the decision of when to tell an upstream
//! source (the line socket reader, or the bus subscription) to pause or
//! resume — the Forwarder itself only tracks queue length.

use crate::forwarder::{Forwarder, Stats};
use bridge_protocol::capability::{BackpressureSink, BusPublisher};
use bridge_protocol::message::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// `max_in_flight` is applied with a 20% safety margin (spec.md §4.4).
pub fn effective_max_in_flight(max_send_simult: usize) -> usize {
    ((max_send_simult as f64) * 0.8) as usize
}

/// Backpressure engages once the queue is this full of `Q_max`, and
/// disengages once it drains back below this (spec.md §5).
const PAUSE_THRESHOLD_PCT: f64 = 0.99;
const RESUME_THRESHOLD_PCT: f64 = 0.10;

/// Two-state machine (`DISCONNECTED | CONNECTED`) driving one direction's
/// `Forwarder`, with hysteresis-based backpressure toward its upstream
/// source (spec.md §3, §4.4, §5).
pub struct SessionManager<P: BusPublisher + 'static> {
    forwarder: Arc<Forwarder<P>>,
    upstream: Arc<dyn BackpressureSink>,
    connected: AtomicBool,
    paused: AtomicBool,
}

impl<P: BusPublisher + 'static> SessionManager<P> {
    pub fn new(forwarder: Arc<Forwarder<P>>, upstream: Arc<dyn BackpressureSink>) -> Arc<Self> {
        Arc::new(SessionManager {
            forwarder,
            upstream,
            connected: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        })
    }

    pub fn start(&self) {
        self.forwarder.start();
    }

    pub fn stop(&self) {
        self.forwarder.stop();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Stats {
        self.forwarder.stats()
    }

    /// Accept a message from upstream, then re-evaluate backpressure
    /// (spec.md §5).
    pub fn ingest(&self, msg: Message) {
        self.forwarder.ingest(msg);
        self.evaluate_backpressure();
    }

    /// Reclaim retry-store disk space once a backlog has fully drained.
    /// Advisory; call periodically (e.g. from the same tick that polls
    /// `stats()`) rather than on every message.
    pub fn maybe_vacuum_retry_store(&self) {
        self.forwarder.maybe_vacuum_retry_store();
    }

    /// DISCONNECTED→CONNECTED: reset counters, resume the Forwarder
    /// (spec.md §4.4, "onConnected").
    pub fn on_connected(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("bus session connected");
        self.forwarder.on_connected();
    }

    /// CONNECTED→DISCONNECTED: pause the Forwarder, flush RetryStore
    /// buffers (spec.md §4.4, "onDisconnected").
    pub fn on_disconnected(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "bus session disconnected");
        self.forwarder.on_disconnected();
    }

    fn evaluate_backpressure(&self) {
        let q_max = self.forwarder.q_max();
        if q_max == 0 {
            return;
        }
        let len = self.forwarder.queue_len();
        let fill = len as f64 / q_max as f64;

        if !self.paused.load(Ordering::SeqCst) && fill >= PAUSE_THRESHOLD_PCT {
            self.paused.store(true, Ordering::SeqCst);
            warn!(queue_len = len, q_max, "queue above pause threshold; applying backpressure");
            self.upstream.pause();
        } else if self.paused.load(Ordering::SeqCst) && fill <= RESUME_THRESHOLD_PCT {
            self.paused.store(false, Ordering::SeqCst);
            info!(queue_len = len, q_max, "queue drained below resume threshold; releasing backpressure");
            self.upstream.resume();
        }
    }
}
