use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use pipestream_data::DataServer;
use pipestream_streaming::{InboundHandler, InboundMessage, MessageSender};

/// Logs every inbound message, publishes it on the data server and,
/// in relay mode, forwards it along the flow it arrived with.
pub struct NodeHandler {
    relay: bool,
    data_server: Option<Arc<DataServer>>,
}

impl NodeHandler {
    pub fn new(relay: bool, data_server: Option<Arc<DataServer>>) -> Self {
        Self { relay, data_server }
    }
}

#[async_trait]
impl InboundHandler for NodeHandler {
    async fn on_message(&self, message: InboundMessage, sender: MessageSender) {
        info!(
            origin = %message.origin,
            remaining_hops = message.flow.hops().len(),
            "Message received"
        );

        if let Some(server) = &self.data_server {
            let task_id = message
                .payload
                .get("task_id")
                .and_then(|id| id.as_str())
                .map(String::from);
            if let Some(task_id) = task_id {
                debug!(task_id = %task_id, "Publishing inbound result");
                server.set_sending_state(task_id, message.payload.clone());
            }
        }

        if self.relay {
            match sender.send(message.payload, None) {
                Ok(true) => debug!(origin = %message.origin, "Message relayed"),
                Ok(false) => debug!(origin = %message.origin, "No downstream consumer for relayed message"),
                Err(e) => warn!(origin = %message.origin, error = %e, "Failed to relay message"),
            }
        }
    }
}
