use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Fire-and-forget pub/sub transport between the controller and node agents.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Returns how many subscribers received the message.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, BusError>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError>;
}

/// In-process bus. Messages published to a channel nobody listens on are
/// dropped and reported as zero receivers.
#[derive(Clone)]
pub struct InMemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str, create: bool) -> Result<Option<broadcast::Sender<String>>, BusError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| BusError::Transport("channel registry poisoned".to_string()))?;
        if let Some(sender) = channels.get(channel) {
            return Ok(Some(sender.clone()));
        }
        if !create {
            return Ok(None);
        }
        let (sender, _) = broadcast::channel(self.capacity);
        channels.insert(channel.to_string(), sender.clone());
        Ok(Some(sender))
    }
}

#[async_trait]
impl CommandBus for InMemoryBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, BusError> {
        let Some(sender) = self.sender(channel, false)? else {
            return Ok(0);
        };
        Ok(sender.send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BusError> {
        let sender = self
            .sender(channel, true)?
            .ok_or_else(|| BusError::Transport(format!("channel {channel} unavailable")))?;
        let stream = BroadcastStream::new(sender.subscribe()).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }
}
