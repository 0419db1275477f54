//! The send-worker pipeline shared by both forwarding directions
//! (spec.md §4.3).
//!
//! One `Forwarder` runs per direction; it is generic over whatever
//! implements `BusPublisher` for that direction's sink, so the same type
//! drives both the socket→bus pipeline (sink = bus publisher adapter) and
//! the bus→socket pipeline (sink = local-socket writer, see
//! `endpoints::line_socket`).

use crate::storage::retry_store::{NewEntry, RetryEntry, RetryStore, RetryStoreError};
use bridge_protocol::capability::{BoxFuture, BusPublisher, PublishOutcome, PublishRequest, TransportError};
use bridge_protocol::message::{Kind, Message, MessageBody};
use bridge_protocol::wire::WireForm;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Snapshot of forwarder counters (spec.md §4.3, `stats()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub forwarded: u64,
    pub sent: u64,
    pub queue_len: usize,
    pub retry_in_buf: usize,
    pub retry_out_buf: usize,
    pub retry_size: i64,
    /// Entries the RetryStore refused to persist, held in memory only.
    /// Non-zero here means the backing disk is in trouble.
    pub fallback_len: usize,
}

/// Tunables a `Forwarder` is constructed with (spec.md §4.4, §6).
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upper bound on outstanding `PendingReplies` (already the 0.8×
    /// effective value — see `session::effective_max_in_flight`).
    pub max_in_flight: usize,
    /// `perf` messages are accumulated until this many are buffered, then
    /// sent as one `perfs` aggregate. `1` disables batching.
    pub batch_size: usize,
    /// Capacity of the in-memory queue. `0` means unbounded.
    pub q_max: usize,
    /// Wire form this direction's sink expects its payloads serialized as.
    pub wire_form: WireForm,
}

#[derive(Default)]
struct BatchState {
    buf: Vec<Message>,
}

/// Owns the InMemoryQueue, the RetryStore, and drives messages to `P`
/// (spec.md §4.3).
pub struct Forwarder<P: BusPublisher + 'static> {
    queue: Mutex<VecDeque<Message>>,
    retry: Mutex<RetryStore>,
    publisher: Arc<P>,
    cfg: ForwarderConfig,
    connected: AtomicBool,
    processing: AtomicBool,
    batch: Mutex<BatchState>,
    /// Entries that failed `RetryStore::put` and would otherwise be lost
    /// (spec.md §7, "RetryStore I/O error"). Drained ahead of the RetryStore
    /// itself on the next pump so a struggling disk doesn't reorder traffic
    /// behind it.
    fallback: Mutex<VecDeque<NewEntry>>,
    forwarded: AtomicU64,
    sent: AtomicU64,
    notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: BusPublisher + 'static> Forwarder<P> {
    pub fn new(retry: RetryStore, publisher: Arc<P>, cfg: ForwarderConfig) -> Arc<Self> {
        Arc::new(Forwarder {
            queue: Mutex::new(VecDeque::new()),
            retry: Mutex::new(retry),
            publisher,
            cfg,
            connected: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            batch: Mutex::new(BatchState::default()),
            fallback: Mutex::new(VecDeque::new()),
            forwarded: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            notify: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Place `msg` at the tail of the InMemoryQueue (or the batch buffer,
    /// for batch-eligible kinds) and wake the send worker. Never blocks
    /// indefinitely (spec.md §4.3, "ingest").
    ///
    /// A `perfs` batch arriving from the receiving side is unwrapped and
    /// its children re-ingested individually, in order (spec.md §4.3).
    pub fn ingest(&self, msg: Message) {
        if let MessageBody::Batch(items) = msg.body {
            for item in items {
                self.ingest(item);
            }
            return;
        }

        self.forwarded.fetch_add(1, Ordering::Relaxed);

        if self.cfg.batch_size > 1 && msg.kind.batch_eligible() {
            let full_batch = {
                let mut batch = self.batch.lock().expect("batch mutex poisoned");
                batch.buf.push(msg);
                if batch.buf.len() >= self.cfg.batch_size {
                    Some(std::mem::take(&mut batch.buf))
                } else {
                    None
                }
            };
            if let Some(items) = full_batch {
                self.push_queue(Message {
                    kind: Kind::Perfs,
                    routing_key: None,
                    persistent: true,
                    recipient: None,
                    body: MessageBody::Batch(items),
                });
            }
            return;
        }

        self.push_queue(msg);
    }

    fn push_queue(&self, msg: Message) {
        let mut q = self.queue.lock().expect("queue mutex poisoned");
        q.push_back(msg);
        drop(q);
        self.notify.notify_one();
    }

    /// Current InMemoryQueue length, used by the `SessionManager` for
    /// backpressure hysteresis (spec.md §5).
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue mutex poisoned").len()
    }

    pub fn q_max(&self) -> usize {
        self.cfg.q_max
    }

    /// Opens the retry store (already open at construction time here — see
    /// `RetryStore::open`), starts the send worker and the 5-second
    /// periodic tick (spec.md §4.3, "start").
    pub fn start(self: &Arc<Self>) {
        let worker = self.clone();
        let worker_handle = tokio::spawn(async move { worker.run().await });

        let ticker = self.clone();
        let tick_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                ticker.notify.notify_one();
                ticker.maybe_vacuum_retry_store();
            }
        });

        self.tasks.lock().expect("tasks mutex poisoned").extend([worker_handle, tick_handle]);
    }

    /// Pauses the send worker, drains the InMemoryQueue (and any pending
    /// batch) into the RetryStore, and flushes it (spec.md §4.3, "stop").
    /// A barrier: no further publishes occur once this returns (spec.md §5).
    pub fn stop(&self) {
        for handle in self.tasks.lock().expect("tasks mutex poisoned").drain(..) {
            handle.abort();
        }
        self.drain_queue_to_retry();
        self.flush_batch_to_retry();
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        if let Err(e) = retry.flush() {
            error!(error = %e, "failed to flush retry store on stop");
        }
    }

    /// Reclaim retry-store disk space once the backlog has fully drained
    /// (spec.md §4 supplement, "retry-store vacuum on backlog drain").
    /// Advisory disk hygiene only; never required for correctness.
    pub fn maybe_vacuum_retry_store(&self) {
        self.retry.lock().expect("retry mutex poisoned").maybe_vacuum();
    }

    pub fn stats(&self) -> Stats {
        let queue_len = self.queue_len();
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        let retry_size = retry.size().unwrap_or(-1);
        Stats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            queue_len,
            retry_in_buf: retry.buffer_in_len(),
            retry_out_buf: retry.buffer_out_len(),
            retry_size,
            fallback_len: self.fallback.lock().expect("fallback mutex poisoned").len(),
        }
    }

    // -----------------------------------------------------------------
    // Session notifications
    // -----------------------------------------------------------------

    pub(crate) fn on_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.sent.store(0, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub(crate) fn on_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.flush_batch_to_retry();
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        if let Err(e) = retry.flush() {
            error!(error = %e, "failed to flush retry store on disconnect");
        }
    }

    // -----------------------------------------------------------------
    // Send worker (spec.md §4.3, "Send worker algorithm")
    // -----------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            self.pump().await;
        }
    }

    async fn pump(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pump_inner().await;
        self.processing.store(false, Ordering::SeqCst);
    }

    async fn pump_inner(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            self.drain_queue_to_retry();
            return;
        }

        let mut pending: FuturesUnordered<PendingSend<'_>> = FuturesUnordered::new();

        loop {
            // Re-checked every iteration, not just at entry: `on_disconnected`
            // may flip this mid-loop, and once it does no new publish may be
            // issued (spec.md §4.4, "pause the Forwarder").
            if !self.connected.load(Ordering::SeqCst) {
                break;
            }

            let req = if let Some(req) = self.next_fallback_request() {
                req
            } else {
                match self.next_retry_request() {
                    Ok(Some(req)) => req,
                    Ok(None) => match self.next_queue_request() {
                        Some(req) => req,
                        None => break,
                    },
                    Err(RetryStoreError::Busy) => {
                        // spec.md §7: lock contention suspends the worker 0.5s
                        // and retries.
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "retry store pop failed; falling back to in-memory queue this round");
                        match self.next_queue_request() {
                            Some(req) => req,
                            None => break,
                        }
                    }
                }
            };

            if req.kind == "oneToOne" {
                // push-only: no completion to track (spec.md §4.3 step 2c).
                // Not retried on failure — there is no durable outcome to
                // distinguish a lost one-to-one nudge from a delivered one.
                match self.publisher.publish(req).await {
                    Ok(_) => {
                        self.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TransportError(reason)) => {
                        warn!(error = %reason, "oneToOne publish failed; not retried");
                    }
                }
                continue;
            }

            let retry_entry = NewEntry {
                kind: req.kind.clone(),
                routing_key: req.routing_key.clone(),
                persistent: req.persistent,
                recipient: req.recipient.clone(),
                payload: req.payload.clone(),
            };
            let fut = self.publisher.publish(req);
            pending.push(PendingSend { fut, retry_entry: Some(retry_entry) });

            // spec.md §4.3 step d: once PendingReplies is at cap, suspend
            // the loop and wait for ALL of them to settle before refilling.
            if pending.len() >= self.cfg.max_in_flight.max(1) {
                self.drain_all_pending(&mut pending).await;
            }
        }

        self.drain_all_pending(&mut pending).await;

        // Broke out because `on_disconnected` fired mid-loop: whatever was
        // still sitting in the queue never got a chance to be dequeued above
        // and must not be silently dropped.
        if !self.connected.load(Ordering::SeqCst) {
            self.drain_queue_to_retry();
        }
    }

    async fn drain_all_pending(&self, pending: &mut FuturesUnordered<PendingSend<'_>>) {
        while let Some(outcome) = pending.next().await {
            self.handle_completion(outcome);
        }
    }

    fn handle_completion(&self, outcome: SendOutcome) {
        match outcome.result {
            Ok(Some(PublishOutcome::Ack)) | Ok(None) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(PublishOutcome::Rejected)) => {
                warn!(kind = %outcome.retry_entry.kind, "broker rejected message as not-acceptable; dropping");
            }
            Err(TransportError(reason)) => {
                warn!(error = %reason, kind = %outcome.retry_entry.kind, "transient transport error; re-queuing to retry store");
                self.requeue(outcome.retry_entry);
            }
        }
    }

    fn requeue(&self, entry: NewEntry) {
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        if let Err(e) = retry.put(entry.clone()) {
            error!(error = %e, "retry store put failed; message held in memory for the next pump");
            drop(retry);
            self.fallback.lock().expect("fallback mutex poisoned").push_back(entry);
        }
    }

    /// Entries the RetryStore refused to persist (spec.md §7, "RetryStore
    /// I/O error"). Checked ahead of everything else so a struggling disk
    /// doesn't let these fall further out of order.
    fn next_fallback_request(&self) -> Option<PublishRequest> {
        let entry = self.fallback.lock().expect("fallback mutex poisoned").pop_front()?;
        Some(PublishRequest {
            kind: entry.kind,
            routing_key: entry.routing_key,
            payload: entry.payload,
            persistent: entry.persistent,
            recipient: entry.recipient,
        })
    }

    /// RetryStore contents take priority over the in-memory queue whenever
    /// both are non-empty (spec.md §4.3, "restore-order priority").
    fn next_retry_request(&self) -> Result<Option<PublishRequest>, RetryStoreError> {
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        Ok(retry.pop()?.map(RetryEntry::into_publish_request))
    }

    fn next_queue_request(&self) -> Option<PublishRequest> {
        let msg = self.queue.lock().expect("queue mutex poisoned").pop_front()?;
        let payload = bridge_protocol::codec::emit(&msg, self.cfg.wire_form);
        Some(PublishRequest::from_message(&msg, payload))
    }

    fn drain_queue_to_retry(&self) {
        let drained: Vec<Message> = {
            let mut q = self.queue.lock().expect("queue mutex poisoned");
            q.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        let entries: Vec<NewEntry> = drained
            .iter()
            .map(|m| {
                let payload = bridge_protocol::codec::emit(m, self.cfg.wire_form);
                NewEntry::from_message(m, payload)
            })
            .collect();
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        if let Err(e) = retry.put_batch(entries) {
            error!(error = %e, "failed to drain in-memory queue to retry store");
        }
    }

    fn flush_batch_to_retry(&self) {
        let items = {
            let mut batch = self.batch.lock().expect("batch mutex poisoned");
            std::mem::take(&mut batch.buf)
        };
        if items.is_empty() {
            return;
        }
        let entries: Vec<NewEntry> = items
            .iter()
            .map(|m| {
                let payload = bridge_protocol::codec::emit(m, self.cfg.wire_form);
                NewEntry::from_message(m, payload)
            })
            .collect();
        let mut retry = self.retry.lock().expect("retry mutex poisoned");
        if let Err(e) = retry.put_batch(entries) {
            error!(error = %e, "failed to flush pending batch to retry store");
        }
    }
}

struct SendOutcome {
    result: Result<Option<PublishOutcome>, TransportError>,
    retry_entry: NewEntry,
}

/// Pairs an in-flight publish future with the data needed to re-queue it on
/// failure, so `PendingReplies` (spec.md §3) can be polled concurrently
/// without a per-message spawned task.
struct PendingSend<'a> {
    fut: BoxFuture<'a, Result<Option<PublishOutcome>, TransportError>>,
    retry_entry: Option<NewEntry>,
}

impl Future for PendingSend<'_> {
    type Output = SendOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.fut.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(SendOutcome {
                result,
                retry_entry: self.retry_entry.take().expect("PendingSend polled after completion"),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::message::{Kind, Message, MessageBody};
    use bridge_test_utils::MockBusPublisher;
    use tempfile::NamedTempFile;

    fn perf(tag: &str) -> Message {
        Message {
            kind: Kind::Perf,
            routing_key: None,
            persistent: true,
            recipient: None,
            body: MessageBody::Perf {
                timestamp: tag.to_owned(),
                host: "h".to_owned(),
                datasource: "d".to_owned(),
                value: "1".to_owned(),
            },
        }
    }

    fn make_forwarder(batch_size: usize) -> (Arc<Forwarder<MockBusPublisher>>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let retry = RetryStore::open(file.path(), "retry_to_bus").unwrap();
        let publisher = Arc::new(MockBusPublisher::new());
        let cfg = ForwarderConfig { max_in_flight: 800, batch_size, q_max: 0, wire_form: WireForm::Amqp };
        (Forwarder::new(retry, publisher, cfg), file)
    }

    #[tokio::test]
    async fn ingest_while_disconnected_drains_to_retry_store_on_wake() {
        let (fwd, _file) = make_forwarder(1);
        fwd.start();
        fwd.ingest(perf("A"));
        fwd.ingest(perf("B"));
        fwd.ingest(perf("C"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = fwd.stats();
        assert_eq!(stats.queue_len, 0);
        assert_eq!(stats.retry_size, 3);
        fwd.stop();
    }

    #[tokio::test]
    async fn connected_delivery_drains_queue_and_increments_sent() {
        let (fwd, _file) = make_forwarder(1);
        fwd.on_connected();
        fwd.start();
        fwd.ingest(perf("A"));
        fwd.ingest(perf("B"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = fwd.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.retry_size, 0);
        fwd.stop();
    }

    #[tokio::test]
    async fn batching_accumulates_perf_into_single_aggregate() {
        let (fwd, _file) = make_forwarder(3);
        fwd.on_connected();
        fwd.start();
        fwd.ingest(perf("A"));
        fwd.ingest(perf("B"));
        assert_eq!(fwd.queue_len(), 0, "batch not yet full");
        fwd.ingest(perf("C"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fwd.stats().sent, 1, "one aggregate publish, not three");
        fwd.stop();
    }

    #[tokio::test]
    async fn stop_flushes_partial_batch_to_retry_store_not_dropped() {
        let (fwd, _file) = make_forwarder(5);
        fwd.ingest(perf("A"));
        fwd.ingest(perf("B"));
        fwd.stop();
        assert_eq!(fwd.stats().retry_size, 2);
    }

    fn make_forwarder_with_cap(
        max_in_flight: usize,
    ) -> (Arc<Forwarder<MockBusPublisher>>, Arc<MockBusPublisher>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let retry = RetryStore::open(file.path(), "retry_to_bus").unwrap();
        let publisher = Arc::new(MockBusPublisher::new());
        let cfg = ForwarderConfig { max_in_flight, batch_size: 1, q_max: 0, wire_form: WireForm::Amqp };
        (Forwarder::new(retry, publisher.clone(), cfg), publisher, file)
    }

    #[tokio::test]
    async fn in_flight_publishes_never_exceed_max_in_flight() {
        let (fwd, publisher, _file) = make_forwarder_with_cap(2);
        publisher.hold_publishes();
        fwd.on_connected();
        fwd.start();
        for tag in ["A", "B", "C", "D"] {
            fwd.ingest(perf(tag));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            publisher.in_flight_count() <= 2,
            "in_flight={} exceeds max_in_flight=2",
            publisher.in_flight_count()
        );
        publisher.release_held_publishes();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fwd.stats().sent, 4);
        fwd.stop();
    }

    #[tokio::test]
    async fn disconnect_mid_pump_stops_new_publishes_and_drains_remainder() {
        let (fwd, publisher, _file) = make_forwarder_with_cap(1);
        publisher.hold_publishes();
        fwd.on_connected();
        fwd.start();
        for tag in ["A", "B", "C"] {
            fwd.ingest(perf(tag));
        }
        // let the worker pick up and hold the first publish, cap reached.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fwd.on_disconnected();
        publisher.release_held_publishes();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = fwd.stats();
        assert_eq!(stats.queue_len, 0, "nothing left unaccounted for in the in-memory queue");
        assert_eq!(stats.sent + stats.retry_size as u64, 3, "every message either sent or retried, none dropped");
        fwd.stop();
    }
}
