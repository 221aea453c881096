//! Listener transport
//!
//! Client side of the bus. Each listener owns one task that connects to an
//! upstream producer, advertises readiness and processes one message at a
//! time. Connection loss or producer silence beyond the liveness timeout
//! moves the listener to `Reconnecting` with exponential backoff.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pipestream_core::config::{StreamingConfig, UpstreamConfig};
use pipestream_core::Encoding;

use crate::flow::FlowPattern;
use crate::stats::DoneReport;
use crate::wire::{self, Frame, Signal};
use crate::CloseOutcome;

/// A message received from an upstream producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Node name of the producer that sent it
    pub origin: String,
    /// Flow left to travel after the producer's hop
    pub flow: FlowPattern,
    pub header: Bytes,
    pub payload: Bytes,
}

/// Processing callback invoked for every delivered message.
///
/// The listener does not advertise readiness again until this returns.
/// The returned value travels back to the producer in the completion report.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, delivery: Delivery) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { interval: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub state: ConnectionState,
    /// Backoff that the next failed attempt would wait
    pub reconnect_interval: Duration,
    pub received: u64,
    pub reconnects: u64,
    pub processing: bool,
}

/// Exponential reconnect backoff.
///
/// Delays come from a `backon` exponential schedule between the reconnect
/// floor and maximum. A successful connection restarts the schedule.
pub struct ReconnectState {
    builder: ExponentialBuilder,
    delays: ExponentialBackoff,
    max: Duration,
    current_delay: Duration,
    failure_count: u32,
}

impl ReconnectState {
    #[must_use]
    pub fn new(floor: Duration, max: Duration) -> Self {
        let max = max.max(floor);
        let builder = ExponentialBuilder::default()
            .with_min_delay(floor)
            .with_max_delay(max)
            .without_max_times();
        let mut delays = builder.build();
        let current_delay = delays.next().unwrap_or(max);
        Self {
            builder,
            delays,
            max,
            current_delay,
            failure_count: 0,
        }
    }

    /// Delay to wait before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.failure_count = self.failure_count.saturating_add(1);
        self.current_delay = self.delays.next().unwrap_or(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.delays = self.builder.build();
        self.current_delay = self.delays.next().unwrap_or(self.max);
        self.failure_count = 0;
    }

    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl fmt::Debug for ReconnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectState")
            .field("max", &self.max)
            .field("current_delay", &self.current_delay)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}

/// Connection settings for one upstream
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub address: String,
    pub upstream: String,
    pub consumer_type: String,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_max: Duration,
    pub drain_timeout: Duration,
}

impl ListenerSettings {
    #[must_use]
    pub fn new(config: &StreamingConfig, upstream: &UpstreamConfig, consumer_type: &str) -> Self {
        Self {
            address: upstream.address(),
            upstream: upstream.node_name.clone(),
            consumer_type: consumer_type.to_string(),
            heartbeat_interval: config.heartbeat_interval(),
            liveness_timeout: config.liveness_timeout(),
            poll_interval: config.poll_interval(),
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
            reconnect_max: config.reconnect_max(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

enum SessionEnd {
    Closed,
    Lost(String),
}

struct Worker {
    settings: ListenerSettings,
    identity: String,
    encoding: Arc<dyn Encoding>,
    handler: Arc<dyn MessageHandler>,
    status: watch::Sender<ListenerStatus>,
    cancel: CancellationToken,
}

type Connection = Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>;

impl Worker {
    async fn run(self) {
        let mut backoff = ReconnectState::new(
            self.settings.reconnect_interval,
            self.settings.reconnect_max,
        );

        while !self.cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting, &backoff);
            let connect = tokio::time::timeout(
                self.settings.connect_timeout,
                TcpStream::connect(self.settings.address.as_str()),
            );
            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = connect => result,
            };

            match connected {
                Ok(Ok(stream)) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected, &backoff);
                    info!(
                        upstream = %self.settings.upstream,
                        address = %self.settings.address,
                        consumer_type = %self.settings.consumer_type,
                        "Listener connected"
                    );
                    match self.session(stream, &mut backoff).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Lost(reason) => {
                            warn!(
                                upstream = %self.settings.upstream,
                                address = %self.settings.address,
                                reason = %reason,
                                "Lost connection to producer"
                            );
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(address = %self.settings.address, error = %e, "Connect failed");
                }
                Err(_) => {
                    debug!(address = %self.settings.address, "Connect timed out");
                }
            }

            let delay = backoff.next_delay();
            self.status.send_modify(|status| {
                status.state = ConnectionState::Reconnecting { interval: delay };
                status.reconnect_interval = backoff.current_delay();
                status.reconnects += 1;
                status.processing = false;
            });
            info!(
                upstream = %self.settings.upstream,
                delay_ms = delay.as_millis(),
                attempt = backoff.failure_count(),
                "Reconnecting to producer"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected, &backoff);
        debug!(upstream = %self.settings.upstream, "Listener stopped");
    }

    fn set_state(&self, state: ConnectionState, backoff: &ReconnectState) {
        self.status.send_modify(|status| {
            status.state = state;
            status.reconnect_interval = backoff.current_delay();
        });
    }

    fn frame(&self, signal: Signal) -> Frame {
        Frame::signal(signal, self.identity.clone(), self.settings.consumer_type.clone())
    }

    async fn send(&self, conn: &mut Connection, frame: Frame) -> Result<(), String> {
        let bytes = frame.encode().map_err(|e| e.to_string())?;
        conn.send(bytes).await.map_err(|e| e.to_string())
    }

    async fn session(&self, stream: TcpStream, backoff: &mut ReconnectState) -> SessionEnd {
        let mut conn = Framed::new(stream, wire::codec());
        if let Err(e) = self.send(&mut conn, self.frame(Signal::Init)).await {
            return SessionEnd::Lost(e);
        }

        let mut advertised = false;
        let mut hold_ready_until: Option<Instant> = None;
        let mut last_receive = Instant::now();
        let mut last_send = Instant::now();

        loop {
            // No new work once a close has started
            if !advertised
                && !self.cancel.is_cancelled()
                && hold_ready_until.is_none_or(|until| Instant::now() >= until)
            {
                if let Err(e) = self.send(&mut conn, self.frame(Signal::Ready)).await {
                    return SessionEnd::Lost(e);
                }
                advertised = true;
                hold_ready_until = None;
                last_send = Instant::now();
            }

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                next = tokio::time::timeout(self.settings.poll_interval, conn.next()) => Some(next),
            };
            let Some(next) = next else {
                self.drain(&mut conn, advertised).await;
                return SessionEnd::Closed;
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    last_receive = Instant::now();
                    backoff.reset();
                    let frame = match Frame::decode(bytes.freeze()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(address = %self.settings.address, error = %e, "Dropping malformed frame");
                            continue;
                        }
                    };
                    match frame.signal {
                        Signal::Msg => {
                            advertised = false;
                            if let Err(e) = self.process(&mut conn, frame).await {
                                return SessionEnd::Lost(e);
                            }
                            last_send = Instant::now();
                            last_receive = Instant::now();
                        }
                        Signal::NoMsg => {
                            advertised = false;
                            hold_ready_until = Some(Instant::now() + self.settings.poll_interval);
                        }
                        Signal::Heartbeat => {
                            debug!(upstream = %self.settings.upstream, "Producer heartbeat");
                        }
                        other => {
                            warn!(signal = %other, "Unexpected signal from producer");
                        }
                    }
                }
                Ok(Some(Err(e))) => return SessionEnd::Lost(e.to_string()),
                Ok(None) => return SessionEnd::Lost("connection closed by producer".to_string()),
                Err(_) => {}
            }

            if last_receive.elapsed() > self.settings.liveness_timeout {
                return SessionEnd::Lost("liveness timeout".to_string());
            }
            if last_send.elapsed() >= self.settings.heartbeat_interval {
                if let Err(e) = self.send(&mut conn, self.frame(Signal::Heartbeat)).await {
                    return SessionEnd::Lost(e);
                }
                last_send = Instant::now();
            }
        }
    }

    /// Graceful shutdown of a live session.
    ///
    /// An outstanding readiness is withdrawn, then any message the producer
    /// dispatched before seeing it is still processed. The session ends once
    /// no message arrives within one drain window.
    async fn drain(&self, conn: &mut Connection, advertised: bool) {
        if advertised && self.send(conn, self.frame(Signal::NotReady)).await.is_err() {
            return;
        }
        let window = self.settings.poll_interval.max(self.settings.heartbeat_interval);
        let mut quiet_until = tokio::time::Instant::now() + window;
        loop {
            let bytes = match tokio::time::timeout_at(quiet_until, conn.next()).await {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(_)) | None) => return,
                Err(_) => break,
            };
            let Ok(frame) = Frame::decode(bytes.freeze()) else {
                continue;
            };
            if frame.signal == Signal::Msg {
                debug!(upstream = %self.settings.upstream, "Processing message dispatched before close");
                if self.process(conn, frame).await.is_err() {
                    return;
                }
                quiet_until = tokio::time::Instant::now() + window;
            }
        }
        let _ = self.send(conn, self.frame(Signal::Disconnect)).await;
        let _ = SinkExt::<Bytes>::close(conn).await;
    }

    async fn process(&self, conn: &mut Connection, frame: Frame) -> Result<(), String> {
        self.status.send_modify(|status| {
            status.received += 1;
            status.processing = true;
        });
        debug!(
            upstream = %self.settings.upstream,
            origin = %frame.identity,
            "Message received"
        );

        let delivery = Delivery {
            origin: frame.identity,
            flow: frame.flow.unwrap_or_default(),
            header: frame.header,
            payload: frame.payload,
        };
        let started = Instant::now();
        let result = self.handler.on_message(delivery).await;
        let report = DoneReport {
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            result,
        };
        self.status.send_modify(|status| status.processing = false);

        let encoded = serde_json::to_value(&report)
            .map_err(pipestream_core::Error::from)
            .and_then(|value| self.encoding.encode(&value))
            .map_err(|e| e.to_string())?;
        let done = Frame::done(
            self.identity.clone(),
            self.settings.consumer_type.clone(),
            encoded,
        );
        self.send(conn, done).await
    }
}

/// One connection to an upstream producer
pub struct ListenerTransport {
    settings: ListenerSettings,
    identity: String,
    encoding: Arc<dyn Encoding>,
    handler: Arc<dyn MessageHandler>,
    status: watch::Sender<ListenerStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl ListenerTransport {
    pub fn new(
        settings: ListenerSettings,
        encoding: Arc<dyn Encoding>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (status, _) = watch::channel(ListenerStatus {
            state: ConnectionState::Disconnected,
            reconnect_interval: settings.reconnect_interval,
            received: 0,
            reconnects: 0,
            processing: false,
        });
        Self {
            identity: uuid::Uuid::new_v4().to_string(),
            settings,
            encoding,
            handler,
            status,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Spawn the connection task; a no-op when already started or closed
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.closing.load(Ordering::SeqCst) {
            return;
        }
        let worker = Worker {
            settings: self.settings.clone(),
            identity: self.identity.clone(),
            encoding: Arc::clone(&self.encoding),
            handler: Arc::clone(&self.handler),
            status: self.status.clone(),
            cancel: self.cancel.clone(),
        };
        *task = Some(tokio::spawn(worker.run()));
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    #[must_use]
    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    /// Stop the listener.
    ///
    /// Forced close aborts the connection task. Graceful close lets a running
    /// callback finish, withdraws readiness, processes whatever was already
    /// dispatched until a drain window passes without a message, then sends a
    /// disconnect signal. The whole drain is bounded by the drain timeout.
    pub async fn close(&self, force: bool) -> CloseOutcome {
        if self.closing.swap(true, Ordering::SeqCst) {
            return CloseOutcome::AlreadyClosing;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if force {
                task.abort();
                let _ = task.await;
            } else if tokio::time::timeout(self.settings.drain_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(
                    upstream = %self.settings.upstream,
                    "Listener did not finish within drain timeout, aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.processing = false;
        });
        info!(upstream = %self.settings.upstream, force, "Listener closed");
        CloseOutcome::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_max() {
        let mut backoff = ReconnectState::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(backoff.failure_count(), 5);

        backoff.reset();
        assert_eq!(backoff.current_delay(), Duration::from_millis(100));
        assert_eq!(backoff.failure_count(), 0);
    }

    #[test]
    fn test_backoff_restarts_after_reset() {
        let mut backoff = ReconnectState::new(Duration::from_millis(50), Duration::from_millis(400));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current_delay(), Duration::from_millis(200));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_max_never_below_floor() {
        let mut backoff = ReconnectState::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_from_config() {
        let upstream = UpstreamConfig {
            node_name: "a".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9100,
        };
        let settings = ListenerSettings::new(&StreamingConfig::default(), &upstream, "b");
        assert_eq!(settings.address, "127.0.0.1:9100");
        assert_eq!(settings.upstream, "a");
        assert_eq!(settings.consumer_type, "b");
        assert_eq!(settings.liveness_timeout, Duration::from_secs(5));
    }
}
