//! Producer transport
//!
//! Server side of the bus. Listeners connect, advertise readiness per
//! consumer type and receive at most one message per advertisement.
//!
//! [`ProducerSession`] holds the protocol state (queue, ready workers,
//! in-flight deliveries, statistics) and is driven synchronously: every
//! incoming frame and timer tick returns the frames to send.
//! [`ProducerTransport`] owns the TCP side and feeds the session.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use pipestream_core::config::StreamingConfig;
use pipestream_core::Encoding;

use crate::error::{Error, Result};
use crate::flow::FlowPattern;
use crate::queue::{Envelope, MessageQueue};
use crate::registry::WorkerRegistry;
use crate::stats::{ConsumerStats, DoneReport, StatisticsEvent, StatisticsSink};
use crate::wire::{self, Frame, Signal};
use crate::CloseOutcome;

/// Frame addressed to a listener identity
pub type Outgoing = (String, Frame);

#[derive(Debug, Clone)]
struct InFlight {
    consumer_type: String,
    sent_at: Instant,
}

/// Protocol state of one producing node
pub struct ProducerSession {
    node_name: String,
    encoding: Arc<dyn Encoding>,
    queue: MessageQueue,
    registry: WorkerRegistry,
    in_flight: HashMap<String, InFlight>,
    stats: HashMap<String, ConsumerStats>,
    max_queue_bytes: usize,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    draining: bool,
}

impl ProducerSession {
    pub fn new(
        node_name: impl Into<String>,
        consumer_types: &[String],
        config: &StreamingConfig,
        encoding: Arc<dyn Encoding>,
    ) -> Self {
        let node_name = node_name.into();
        Self {
            queue: MessageQueue::new(consumer_types, node_name.clone()),
            registry: WorkerRegistry::new(consumer_types, config.liveness_timeout()),
            in_flight: HashMap::new(),
            stats: consumer_types
                .iter()
                .map(|t| (t.clone(), ConsumerStats::default()))
                .collect(),
            max_queue_bytes: config.max_queue_bytes,
            heartbeat_interval: config.heartbeat_interval(),
            last_heartbeat: None,
            draining: false,
            node_name,
            encoding,
        }
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Handle one frame from a listener and return the frames to send back
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Outgoing> {
        let address = frame.identity.as_str();
        let consumer_type = frame.consumer_type.as_str();
        if !self.queue.is_consumer_type(consumer_type) {
            warn!(
                consumer_type = %consumer_type,
                address = %address,
                signal = %frame.signal,
                "Dropping frame for unconfigured consumer type"
            );
            return Vec::new();
        }

        match frame.signal {
            Signal::Init => {
                // A fresh connection cannot still be processing an old delivery
                if self.in_flight.remove(address).is_some() {
                    debug!(address = %address, "Listener re-initialised, clearing in-flight delivery");
                }
                self.registry.remove_address(address);
                info!(consumer_type = %consumer_type, address = %address, "Listener connected");
            }
            Signal::NotReady => {
                self.registry.mark_not_ready(consumer_type, address);
            }
            Signal::Disconnect => {
                self.registry.mark_not_ready(consumer_type, address);
                self.in_flight.remove(address);
                info!(consumer_type = %consumer_type, address = %address, "Listener disconnected");
            }
            Signal::Done => self.on_done(address, consumer_type, &frame.payload, now),
            Signal::Ready => {
                if self.in_flight.contains_key(address) {
                    debug!(address = %address, "Ignoring readiness from in-flight listener");
                } else {
                    self.registry.mark_ready(consumer_type, address, now);
                }
            }
            Signal::Heartbeat => {
                self.registry.refresh(consumer_type, address, now);
            }
            Signal::Msg | Signal::NoMsg => {
                warn!(
                    address = %address,
                    signal = %frame.signal,
                    "Unexpected signal from listener"
                );
                return Vec::new();
            }
        }

        self.dispatch(now)
    }

    fn on_done(&mut self, address: &str, consumer_type: &str, result: &[u8], now: Instant) {
        let Some(delivery) = self.in_flight.remove(address) else {
            debug!(address = %address, "Completion for unknown delivery");
            return;
        };
        let round_trip = now.saturating_duration_since(delivery.sent_at);
        let duration = match self.decode_report(result) {
            Ok(report) => Some(report.duration_ms),
            Err(e) => {
                warn!(address = %address, error = %e, "Invalid completion report");
                None
            }
        };
        if delivery.consumer_type != consumer_type {
            warn!(
                address = %address,
                expected = %delivery.consumer_type,
                consumer_type = %consumer_type,
                "Completion reported under another consumer type"
            );
        }
        if let Some(stats) = self.stats.get_mut(&delivery.consumer_type) {
            stats.record(duration, u64::try_from(round_trip.as_millis()).unwrap_or(u64::MAX));
        }
        debug!(
            consumer_type = %delivery.consumer_type,
            address = %address,
            round_trip_ms = round_trip.as_millis(),
            "Delivery completed"
        );
    }

    fn decode_report(&self, result: &[u8]) -> Result<DoneReport> {
        let value = self.encoding.decode(result)?;
        serde_json::from_value(value).map_err(|e| Error::Encoding(e.into()))
    }

    /// Queue an envelope, evicting the oldest entries while over budget.
    ///
    /// Returns `false` when no configured consumer type is a next hop.
    pub fn produce(&mut self, envelope: Envelope) -> bool {
        if !self.queue.append(envelope) {
            debug!(node = %self.node_name, "Message has no recipient on this producer, discarded");
            return false;
        }
        while self.queue.size_sum() > self.max_queue_bytes && self.queue.evict_oldest() {
            warn!(
                node = %self.node_name,
                size = self.queue.size_sum(),
                max_queue_bytes = self.max_queue_bytes,
                "Queue over budget, evicted oldest message"
            );
        }
        true
    }

    /// Hand pending messages to ready workers
    pub fn dispatch(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let consumer_types: Vec<String> = self.queue.consumer_types().map(String::from).collect();
        for consumer_type in &consumer_types {
            while self.queue.has_pending(consumer_type) {
                let Some(address) = self.registry.take_one(consumer_type) else {
                    break;
                };
                let Some(envelope) = self.queue.pop_for(consumer_type) else {
                    break;
                };
                let flow = envelope.flow.remaining_flow(&self.node_name);
                self.in_flight.insert(
                    address.clone(),
                    InFlight {
                        consumer_type: consumer_type.clone(),
                        sent_at: now,
                    },
                );
                out.push((
                    address,
                    Frame::message(
                        self.node_name.clone(),
                        consumer_type.clone(),
                        flow,
                        envelope.header,
                        envelope.payload,
                    ),
                ));
            }

            if self.draining && !self.queue.has_pending(consumer_type) {
                while let Some(address) = self.registry.take_one(consumer_type) {
                    out.push((
                        address,
                        Frame::signal(Signal::NoMsg, self.node_name.clone(), consumer_type.clone()),
                    ));
                }
            }
        }
        out
    }

    /// Periodic work: heartbeat ready workers, expire idle ones, dispatch
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let heartbeat_due = self
            .last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) >= self.heartbeat_interval);
        if heartbeat_due {
            self.last_heartbeat = Some(now);
            out.extend(self.registry.ready_workers().map(|(consumer_type, address)| {
                (
                    address.to_string(),
                    Frame::signal(Signal::Heartbeat, self.node_name.clone(), consumer_type),
                )
            }));
        }
        self.registry.purge_expired(now);
        out.extend(self.dispatch(now));
        out
    }

    /// Forget a listener whose connection went away
    pub fn peer_lost(&mut self, address: &str) {
        self.registry.remove_address(address);
        if let Some(delivery) = self.in_flight.remove(address) {
            warn!(
                consumer_type = %delivery.consumer_type,
                address = %address,
                "Listener lost with a delivery in flight"
            );
        }
    }

    /// Stop accepting new readiness without pending work
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.queue.is_drained()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    #[must_use]
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// One event per consumer type. `drain` empties the rolling buffers.
    pub fn statistics(&mut self, drain: bool) -> Vec<StatisticsEvent> {
        let timestamp = chrono::Utc::now();
        let mut events = Vec::with_capacity(self.stats.len());
        for consumer_type in self.queue.consumer_types() {
            let Some(stats) = self.stats.get_mut(consumer_type) else {
                continue;
            };
            let (durations, round_trips) = if drain {
                (stats.durations.drain(), stats.round_trips.drain())
            } else {
                (
                    stats.durations.iter().copied().collect(),
                    stats.round_trips.iter().copied().collect(),
                )
            };
            events.push(StatisticsEvent {
                node_name: self.node_name.clone(),
                consumer_type: consumer_type.to_string(),
                sent: self.queue.sent(consumer_type),
                queue_size: self.queue.pending_count(consumer_type),
                durations,
                round_trips,
                responses: stats.responses,
                dropped: self.queue.lost(consumer_type),
                timestamp,
            });
        }
        events
    }
}

struct PeerHandle {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Shared {
    node_name: String,
    session: Mutex<ProducerSession>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    active: AtomicBool,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn send_frames(&self, outgoing: Vec<Outgoing>) {
        if outgoing.is_empty() {
            return;
        }
        let peers = self.peers.lock();
        for (address, frame) in outgoing {
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            let sent = peers
                .get(&address)
                .is_some_and(|peer| peer.tx.send(bytes).is_ok());
            if sent {
                debug!(address = %address, signal = %frame.signal, "Frame sent");
            } else if self.active.load(Ordering::SeqCst) {
                warn!(address = %address, signal = %frame.signal, "Failed to send frame, listener gone");
            } else {
                debug!(address = %address, signal = %frame.signal, "Dropping frame after close");
            }
        }
    }

    fn handle_frame(&self, frame: &Frame) {
        let outgoing = self.session.lock().on_frame(frame, Instant::now());
        self.send_frames(outgoing);
    }

    fn tick(&self) {
        let outgoing = self.session.lock().tick(Instant::now());
        self.send_frames(outgoing);
    }
}

/// TCP server feeding a [`ProducerSession`]
pub struct ProducerTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closing: AtomicBool,
    drain_timeout: Duration,
    poll_interval: Duration,
}

impl ProducerTransport {
    /// Bind the configured port and start serving listeners
    pub async fn start(
        config: &StreamingConfig,
        node_name: &str,
        consumer_types: &[String],
        encoding: Arc<dyn Encoding>,
        sink: Option<Arc<dyn StatisticsSink>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            node_name: node_name.to_string(),
            session: Mutex::new(ProducerSession::new(node_name, consumer_types, config, encoding)),
            peers: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
            next_connection_id: AtomicU64::new(1),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(timer_loop(
            Arc::clone(&shared),
            config.heartbeat_interval(),
            cancel.clone(),
        ));
        if let Some(sink) = sink {
            tracker.spawn(statistics_loop(
                Arc::clone(&shared),
                sink,
                config.statistics_interval(),
                cancel.clone(),
            ));
        }

        info!(
            node = %node_name,
            address = %local_addr,
            consumer_types = ?consumer_types,
            "Producer listening"
        );

        Ok(Self {
            shared,
            local_addr,
            cancel,
            tracker,
            closing: AtomicBool::new(false),
            drain_timeout: config.drain_timeout(),
            poll_interval: config.poll_interval(),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.shared.node_name
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Queue a message and dispatch it to any ready worker.
    ///
    /// Returns `Ok(false)` when no consumer type of this producer is a next hop.
    pub fn send(&self, flow: FlowPattern, header: Bytes, payload: Bytes) -> Result<bool> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (queued, outgoing) = {
            let mut session = self.shared.session.lock();
            let queued = session.produce(Envelope::new(flow, header, payload));
            (queued, session.dispatch(Instant::now()))
        };
        self.shared.send_frames(outgoing);
        Ok(queued)
    }

    /// Current counters without resetting the rolling buffers
    #[must_use]
    pub fn statistics(&self) -> Vec<StatisticsEvent> {
        self.shared.session.lock().statistics(false)
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.shared.session.lock().is_drained()
    }

    /// Shut the transport down.
    ///
    /// Graceful mode waits for the queue to drain (bounded by the drain
    /// timeout) before closing the socket. A concurrent second call returns
    /// [`CloseOutcome::AlreadyClosing`] without touching the socket.
    pub async fn close(&self, force: bool) -> CloseOutcome {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!(node = %self.shared.node_name, "Producer close already in progress");
            return CloseOutcome::AlreadyClosing;
        }

        if !force {
            self.shared.session.lock().begin_drain();
            let deadline = Instant::now() + self.drain_timeout;
            loop {
                let outgoing = {
                    let mut session = self.shared.session.lock();
                    if session.is_drained() {
                        break;
                    }
                    session.dispatch(Instant::now())
                };
                self.shared.send_frames(outgoing);
                if Instant::now() >= deadline {
                    warn!(
                        node = %self.shared.node_name,
                        "Drain timeout elapsed with messages still queued"
                    );
                    break;
                }
                tokio::time::sleep(self.poll_interval.min(Duration::from_millis(50))).await;
            }
        }

        self.shared.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.shared.peers.lock().clear();

        info!(node = %self.shared.node_name, force, "Producer closed");
        CloseOutcome::Closed
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "Accepted streaming connection");
                    tracker.spawn(handle_connection(
                        stream,
                        remote,
                        Arc::clone(&shared),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept streaming connection");
                }
            },
        }
    }
    debug!("Producer accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let connection_id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let (mut writer, mut reader) = Framed::new(stream, wire::codec()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.send(bytes).await {
                debug!(error = %e, "Streaming connection write failed");
                break;
            }
        }
        let _ = writer.close().await;
    });

    let mut identities = Vec::new();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(bytes)) => match Frame::decode(bytes.freeze()) {
                Ok(frame) => {
                    if !identities.contains(&frame.identity) {
                        identities.push(frame.identity.clone());
                    }
                    shared.peers.lock().insert(
                        frame.identity.clone(),
                        PeerHandle {
                            connection_id,
                            tx: tx.clone(),
                        },
                    );
                    shared.handle_frame(&frame);
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Dropping malformed frame");
                }
            },
            Some(Err(e)) => {
                debug!(remote = %remote, error = %e, "Streaming connection read failed");
                break;
            }
            None => break,
        }
    }

    {
        let mut peers = shared.peers.lock();
        for identity in &identities {
            if peers
                .get(identity)
                .is_some_and(|peer| peer.connection_id == connection_id)
            {
                peers.remove(identity);
            }
        }
    }
    {
        let mut session = shared.session.lock();
        for identity in &identities {
            session.peer_lost(identity);
        }
    }
    drop(tx);
    let _ = write_task.await;
    debug!(remote = %remote, "Streaming connection closed");
}

async fn timer_loop(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => shared.tick(),
        }
    }
}

async fn statistics_loop(
    shared: Arc<Shared>,
    sink: Arc<dyn StatisticsSink>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let events = shared.session.lock().statistics(true);
                sink.publish(events);
            }
        }
    }
}
