use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::AgentSection;

use super::bus::{BusError, CommandBus};
use super::protocol::{AgentCommand, Heartbeat};

/// Outcome of publishing a command. `NoListeners` means the node agent is
/// not subscribed right now; callers treat it as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(usize),
    NoListeners,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }
}

pub type HeartbeatStream = Pin<Box<dyn Stream<Item = Heartbeat> + Send>>;

#[derive(Clone)]
pub struct AgentClient {
    bus: Arc<dyn CommandBus>,
    config: AgentSection,
}

impl fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(bus: Arc<dyn CommandBus>, config: AgentSection) -> Self {
        Self { bus, config }
    }

    pub fn command_channel(&self, node_id: &str) -> String {
        format!("{}:{}", self.config.command_channel_prefix, node_id)
    }

    pub async fn send(&self, node_id: &str, command: &AgentCommand) -> Result<Delivery, BusError> {
        let channel = self.command_channel(node_id);
        let receivers = self.bus.publish(&channel, &command.encode()?).await?;
        if receivers == 0 {
            warn!(node_id = %node_id, command = command.name(), "no agent listening");
            return Ok(Delivery::NoListeners);
        }
        debug!(node_id = %node_id, command = command.name(), receivers, "command delivered");
        Ok(Delivery::Delivered(receivers))
    }

    /// Commands addressed to `node_id`, as an agent would receive them.
    /// Undecodable messages are skipped.
    pub async fn commands(
        &self,
        node_id: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = AgentCommand> + Send>>, BusError> {
        let stream = self.bus.subscribe(&self.command_channel(node_id)).await?;
        Ok(Box::pin(stream.filter_map(|raw| match AgentCommand::decode(&raw) {
            Ok(command) => Some(command),
            Err(error) => {
                warn!(%error, "discarding malformed agent command");
                None
            }
        })))
    }

    pub async fn publish_heartbeat(&self, heartbeat: &Heartbeat) -> Result<usize, BusError> {
        let payload = serde_json::to_string(heartbeat)?;
        self.bus
            .publish(&self.config.heartbeat_channel, &payload)
            .await
    }

    pub async fn heartbeats(&self) -> Result<HeartbeatStream, BusError> {
        let stream = self.bus.subscribe(&self.config.heartbeat_channel).await?;
        Ok(Box::pin(stream.filter_map(|raw| {
            match serde_json::from_str::<Heartbeat>(&raw) {
                Ok(heartbeat) => Some(heartbeat),
                Err(error) => {
                    warn!(%error, "discarding malformed heartbeat");
                    None
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::InMemoryBus;

    #[tokio::test]
    async fn send_reports_missing_listener_as_value() {
        let bus = Arc::new(InMemoryBus::default());
        let client = AgentClient::new(bus, AgentSection::default());
        assert_eq!(client.command_channel("vps-9"), "vps-commands:vps-9");

        let delivery = client.send("vps-9", &AgentCommand::Ping).await.unwrap();
        assert_eq!(delivery, Delivery::NoListeners);

        let mut inbox = client.commands("vps-9").await.unwrap();
        let delivery = client.send("vps-9", &AgentCommand::Ping).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered(1));
        assert_eq!(inbox.next().await, Some(AgentCommand::Ping));
    }
}
