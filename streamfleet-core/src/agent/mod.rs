pub mod bus;
pub mod client;
pub mod protocol;

pub use bus::{BusError, CommandBus, InMemoryBus, MessageStream};
pub use client::{AgentClient, Delivery, HeartbeatStream};
pub use protocol::{AgentCommand, Heartbeat, PlaybackOrder, PlaylistFile, StreamConfig};
