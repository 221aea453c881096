//! Streaming coordinator
//!
//! Per-node facade over one optional producer and any number of listeners.
//! Inbound messages are decoded and handed to an [`InboundHandler`] together
//! with a [`MessageSender`] that can publish follow-up messages through this
//! node's producer.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use pipestream_core::config::{StreamingConfig, UpstreamConfig};
use pipestream_core::encoding::encoding_for;
use pipestream_core::Encoding;

use crate::error::{Error, Result};
use crate::flow::FlowPattern;
use crate::listener::{Delivery, ListenerSettings, ListenerStatus, ListenerTransport, MessageHandler};
use crate::producer::ProducerTransport;
use crate::stats::{StatisticsEvent, StatisticsSink};
use crate::CloseOutcome;

/// Change to the set of upstream producers this node listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChange {
    Add(UpstreamConfig),
    Del(UpstreamConfig),
}

/// Decoded message handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub payload: Value,
    /// Node name of the upstream producer
    pub origin: String,
    pub flow: FlowPattern,
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage, sender: MessageSender);
}

/// Message to publish through the node's producer
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub message: Value,
    /// Named flow from the flow table
    pub flow_name: Option<String>,
    /// Explicit pattern, used when continuing an inbound flow
    pub flow_pattern: Option<FlowPattern>,
}

impl SendRequest {
    #[must_use]
    pub fn new(message: Value) -> Self {
        Self {
            message,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_flow_name(mut self, name: impl Into<String>) -> Self {
        self.flow_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_flow_pattern(mut self, pattern: FlowPattern) -> Self {
        self.flow_pattern = Some(pattern);
        self
    }
}

struct ProducerSlot {
    transport: Arc<ProducerTransport>,
    flows: HashMap<String, FlowPattern>,
    default_flow: Option<String>,
}

struct Inner {
    node_name: String,
    config: StreamingConfig,
    encoding: Arc<dyn Encoding>,
    producer: RwLock<Option<ProducerSlot>>,
    listeners: Mutex<IndexMap<String, Arc<ListenerTransport>>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    listening: AtomicBool,
    stopping: AtomicBool,
}

impl Inner {
    fn send_message(&self, request: SendRequest) -> Result<bool> {
        let slot = self.producer.read();
        let Some(slot) = slot.as_ref() else {
            return Err(Error::NoProducer);
        };

        let flow = match request.flow_pattern {
            Some(pattern) if request.flow_name.is_none() => pattern,
            _ => {
                let name = request
                    .flow_name
                    .as_deref()
                    .or(slot.default_flow.as_deref())
                    .ok_or(Error::NoDefaultFlow)?;
                slot.flows
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownFlow(name.to_string()))?
            }
        };

        let (header, payload) = self.encoding.encode_header_payload(&request.message)?;
        slot.transport.send(flow, header, payload)
    }
}

/// Publishes follow-up messages from inside an inbound handler.
///
/// Bound to the flow the inbound message arrived with, so sending without a
/// flow name continues that flow.
#[derive(Clone)]
pub struct MessageSender {
    inner: Weak<Inner>,
    flow: FlowPattern,
}

impl MessageSender {
    #[must_use]
    pub fn flow(&self) -> &FlowPattern {
        &self.flow
    }

    /// Send `message` along the inbound flow, or along `flow_name` when given
    pub fn send(&self, message: Value, flow_name: Option<&str>) -> Result<bool> {
        let inner = self.inner.upgrade().ok_or(Error::Closed)?;
        let request = match flow_name {
            Some(name) => SendRequest::new(message).with_flow_name(name),
            None => SendRequest::new(message).with_flow_pattern(self.flow.clone()),
        };
        inner.send_message(request)
    }
}

/// Bridges listener deliveries to the coordinator's inbound handler
struct InboundAdapter {
    inner: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for InboundAdapter {
    async fn on_message(&self, delivery: Delivery) -> Option<Value> {
        let inner = self.inner.upgrade()?;
        let payload = match inner
            .encoding
            .decode_header_payload(&delivery.header, &delivery.payload)
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(origin = %delivery.origin, error = %e, "Failed to decode inbound message");
                return None;
            }
        };
        let handler = inner.handler.read().clone();
        let Some(handler) = handler else {
            debug!(origin = %delivery.origin, "No inbound handler registered, message ignored");
            return None;
        };
        let sender = MessageSender {
            inner: Arc::downgrade(&inner),
            flow: delivery.flow.clone(),
        };
        drop(inner);
        handler
            .on_message(
                InboundMessage {
                    payload,
                    origin: delivery.origin,
                    flow: delivery.flow,
                },
                sender,
            )
            .await;
        None
    }
}

/// Streaming facade for one pipeline node
#[derive(Clone)]
pub struct StreamingCoordinator {
    inner: Arc<Inner>,
}

impl StreamingCoordinator {
    pub fn new(node_name: impl Into<String>, config: StreamingConfig) -> Result<Self> {
        let encoding = encoding_for(&config.encoding)?;
        Ok(Self {
            inner: Arc::new(Inner {
                node_name: node_name.into(),
                config,
                encoding,
                producer: RwLock::new(None),
                listeners: Mutex::new(IndexMap::new()),
                handler: RwLock::new(None),
                listening: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    /// Register the handler that receives every inbound message
    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Start this node's producer serving `consumer_types`.
    ///
    /// A previously configured producer is closed before the new one binds,
    /// so a fixed streaming port can be reused.
    pub async fn setup_producer(
        &self,
        consumer_types: &[String],
        flows: HashMap<String, FlowPattern>,
        default_flow: Option<String>,
        sink: Option<Arc<dyn StatisticsSink>>,
    ) -> Result<SocketAddr> {
        if let Some(name) = &default_flow {
            if !flows.contains_key(name) {
                return Err(Error::UnknownFlow(name.clone()));
            }
        }

        let previous = self.inner.producer.write().take();
        if let Some(previous) = previous {
            info!(node = %self.inner.node_name, "Replacing existing producer");
            previous.transport.close(true).await;
        }

        let transport = ProducerTransport::start(
            &self.inner.config,
            &self.inner.node_name,
            consumer_types,
            Arc::clone(&self.inner.encoding),
            sink,
        )
        .await?;
        let address = transport.local_addr();
        *self.inner.producer.write() = Some(ProducerSlot {
            transport: Arc::new(transport),
            flows,
            default_flow,
        });
        Ok(address)
    }

    /// Apply upstream changes against the running listeners.
    ///
    /// Adding an address that already has a listener and deleting one that
    /// has none are both no-ops. New listeners connect right away once
    /// [`start_listening`](Self::start_listening) has been called.
    pub async fn setup_listeners(&self, changes: Vec<UpstreamChange>) {
        let mut removed = Vec::new();
        {
            let mut listeners = self.inner.listeners.lock();
            for change in changes {
                match change {
                    UpstreamChange::Add(upstream) => {
                        let address = upstream.address();
                        if listeners.contains_key(&address) {
                            debug!(address = %address, "Listener already running");
                            continue;
                        }
                        let listener = Arc::new(ListenerTransport::new(
                            ListenerSettings::new(
                                &self.inner.config,
                                &upstream,
                                &self.inner.node_name,
                            ),
                            Arc::clone(&self.inner.encoding),
                            Arc::new(InboundAdapter {
                                inner: Arc::downgrade(&self.inner),
                            }),
                        ));
                        if self.inner.listening.load(Ordering::SeqCst) {
                            listener.start();
                        }
                        info!(
                            upstream = %upstream.node_name,
                            address = %address,
                            "Listener added"
                        );
                        listeners.insert(address, listener);
                    }
                    UpstreamChange::Del(upstream) => {
                        let address = upstream.address();
                        match listeners.shift_remove(&address) {
                            Some(listener) => {
                                info!(upstream = %upstream.node_name, address = %address, "Listener removed");
                                removed.push(listener);
                            }
                            None => debug!(address = %address, "No listener to remove"),
                        }
                    }
                }
            }
        }
        for listener in removed {
            listener.close(false).await;
        }
    }

    /// Start every configured listener
    pub fn start_listening(&self) {
        self.inner.listening.store(true, Ordering::SeqCst);
        for listener in self.inner.listeners.lock().values() {
            listener.start();
        }
    }

    /// Publish a message through this node's producer.
    ///
    /// Returns `Ok(false)` when the resolved flow names none of the
    /// producer's consumer types as next hop.
    pub fn send_message(&self, request: SendRequest) -> Result<bool> {
        self.inner.send_message(request)
    }

    /// Close every listener, then the producer.
    ///
    /// Both are released, so the node can set up streaming again afterwards.
    /// A call made while another stop is running returns
    /// [`CloseOutcome::AlreadyClosing`].
    pub async fn stop_streaming(&self, force: bool) -> CloseOutcome {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            debug!(node = %self.inner.node_name, "Stop already in progress");
            return CloseOutcome::AlreadyClosing;
        }
        info!(node = %self.inner.node_name, force, "Stopping streaming");

        let listeners: Vec<_> = self.inner.listeners.lock().drain(..).map(|(_, l)| l).collect();
        self.inner.listening.store(false, Ordering::SeqCst);
        for listener in listeners {
            listener.close(force).await;
        }

        let producer = self.inner.producer.write().take();
        if let Some(producer) = producer {
            producer.transport.close(force).await;
        }

        self.inner.stopping.store(false, Ordering::SeqCst);
        info!(node = %self.inner.node_name, "Streaming stopped");
        CloseOutcome::Closed
    }

    /// Current producer counters, without resetting the rolling buffers
    #[must_use]
    pub fn producer_statistics(&self) -> Option<Vec<StatisticsEvent>> {
        self.inner
            .producer
            .read()
            .as_ref()
            .map(|slot| slot.transport.statistics())
    }

    #[must_use]
    pub fn producer_address(&self) -> Option<SocketAddr> {
        self.inner
            .producer
            .read()
            .as_ref()
            .map(|slot| slot.transport.local_addr())
    }

    /// Status of every listener keyed by upstream address
    #[must_use]
    pub fn listener_statuses(&self) -> Vec<(String, ListenerStatus)> {
        self.inner
            .listeners
            .lock()
            .iter()
            .map(|(address, listener)| (address.clone(), listener.status()))
            .collect()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Hop;

    fn coordinator() -> StreamingCoordinator {
        let config = StreamingConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..StreamingConfig::default()
        };
        StreamingCoordinator::new("a", config).unwrap()
    }

    fn flows() -> HashMap<String, FlowPattern> {
        HashMap::from([(
            "main".to_string(),
            FlowPattern::new(vec![Hop::new("a", ["b"])]),
        )])
    }

    fn upstream(port: u16) -> UpstreamConfig {
        UpstreamConfig {
            node_name: "up".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_send_without_producer() {
        let coordinator = coordinator();
        let err = coordinator
            .send_message(SendRequest::new(serde_json::json!({"x": 1})))
            .unwrap_err();
        assert!(matches!(err, Error::NoProducer));
    }

    #[tokio::test]
    async fn test_flow_resolution_errors() {
        let coordinator = coordinator();
        coordinator
            .setup_producer(&["b".to_string()], flows(), None, None)
            .await
            .unwrap();

        let err = coordinator
            .send_message(SendRequest::new(Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::NoDefaultFlow));

        let err = coordinator
            .send_message(SendRequest::new(Value::Null).with_flow_name("other"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFlow(name) if name == "other"));

        assert!(coordinator
            .send_message(SendRequest::new(Value::Null).with_flow_name("main"))
            .unwrap());
        coordinator.stop_streaming(true).await;
    }

    #[tokio::test]
    async fn test_default_flow_must_exist() {
        let coordinator = coordinator();
        let err = coordinator
            .setup_producer(&["b".to_string()], flows(), Some("missing".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFlow(_)));
    }

    #[tokio::test]
    async fn test_explicit_pattern_wins_over_default() {
        let coordinator = coordinator();
        coordinator
            .setup_producer(&["b".to_string()], flows(), Some("main".to_string()), None)
            .await
            .unwrap();

        // Pattern routing to a type this producer does not serve
        let elsewhere = FlowPattern::new(vec![Hop::new("a", ["z"])]);
        assert!(!coordinator
            .send_message(SendRequest::new(Value::Null).with_flow_pattern(elsewhere))
            .unwrap());
        assert!(coordinator.send_message(SendRequest::new(Value::Null)).unwrap());
        coordinator.stop_streaming(true).await;
    }

    #[tokio::test]
    async fn test_upstream_changes_are_idempotent() {
        let coordinator = coordinator();
        coordinator
            .setup_listeners(vec![
                UpstreamChange::Add(upstream(1)),
                UpstreamChange::Add(upstream(1)),
                UpstreamChange::Add(upstream(2)),
            ])
            .await;
        assert_eq!(coordinator.listener_count(), 2);

        coordinator
            .setup_listeners(vec![
                UpstreamChange::Del(upstream(1)),
                UpstreamChange::Del(upstream(3)),
            ])
            .await;
        assert_eq!(coordinator.listener_count(), 1);
        assert_eq!(coordinator.listener_statuses()[0].0, "127.0.0.1:2");
    }

    #[tokio::test]
    async fn test_stop_releases_producer_for_next_phase() {
        // Fixed port, so a leaked producer would make the rebind fail
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = StreamingConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..StreamingConfig::default()
        };
        let coordinator = StreamingCoordinator::new("a", config).unwrap();
        let types = ["b".to_string()];

        coordinator.setup_producer(&types, flows(), None, None).await.unwrap();
        // Replacing binds the same port again
        coordinator.setup_producer(&types, flows(), None, None).await.unwrap();
        assert_eq!(coordinator.stop_streaming(true).await, CloseOutcome::Closed);
        assert!(coordinator.producer_address().is_none());
        assert!(matches!(
            coordinator.send_message(SendRequest::new(Value::Null).with_flow_name("main")),
            Err(Error::NoProducer)
        ));

        let address = coordinator.setup_producer(&types, flows(), None, None).await.unwrap();
        assert_eq!(address.port(), port);
        assert!(coordinator
            .send_message(SendRequest::new(Value::Null).with_flow_name("main"))
            .unwrap());
        assert_eq!(coordinator.stop_streaming(true).await, CloseOutcome::Closed);
        assert!(matches!(
            coordinator.send_message(SendRequest::new(Value::Null).with_flow_name("main")),
            Err(Error::NoProducer)
        ));
        assert_eq!(coordinator.listener_count(), 0);
    }
}
