//! Flow-routed streaming message bus between pipeline nodes.
//!
//! A node that produces results runs one [`ProducerTransport`]; every
//! downstream node type connects to it with a [`ListenerTransport`] and is
//! handed each message whose flow pattern names it as a next hop. The
//! [`StreamingCoordinator`] ties both sides together for one node.

pub mod coordinator;
pub mod error;
pub mod flow;
pub mod listener;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod wire;

pub use coordinator::{
    InboundHandler, InboundMessage, MessageSender, SendRequest, StreamingCoordinator,
    UpstreamChange,
};
pub use error::{Error, Result};
pub use flow::{FlowPattern, Hop};
pub use listener::{
    ConnectionState, Delivery, ListenerSettings, ListenerStatus, ListenerTransport, MessageHandler,
};
pub use producer::{ProducerSession, ProducerTransport};
pub use queue::{Envelope, MessageQueue};
pub use registry::WorkerRegistry;
pub use stats::{DoneReport, RingBuffer, StatisticsEvent, StatisticsSink};
pub use wire::{Frame, Signal, WireError};

/// Result of a `close`/`stop` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call performed the shutdown
    Closed,
    /// Another call is already shutting the component down
    AlreadyClosing,
}
