//! Messages exchanged with node agents.
//!
//! Commands travel as JSON objects tagged by a `command` field; the names
//! are the agent's existing vocabulary and must not change.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackOrder {
    #[default]
    Sequential,
    Random,
}

impl PlaybackOrder {
    /// Traversal order for `files`; `Random` reshuffles on every call.
    pub fn arrange<T: Clone>(&self, files: &[T]) -> Vec<T> {
        let mut ordered = files.to_vec();
        if *self == PlaybackOrder::Random {
            ordered.shuffle(&mut rand::thread_rng());
        }
        ordered
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistFile {
    pub file_id: String,
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub title: String,
    pub files: Vec<PlaylistFile>,
    pub rtmp_endpoints: Vec<String>,
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
    #[serde(default)]
    pub playlist_order: PlaybackOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
    StartStream {
        stream_id: String,
        config: StreamConfig,
    },
    StopStream {
        stream_id: String,
    },
    UpdatePlaylist {
        stream_id: String,
        files: Vec<PlaylistFile>,
    },
    SetLoopMode {
        stream_id: String,
        enabled: bool,
    },
    SetPlaybackOrder {
        stream_id: String,
        order: PlaybackOrder,
    },
    AddVideos {
        stream_id: String,
        file_ids: Vec<String>,
    },
    DeleteVideos {
        stream_id: String,
        file_ids: Vec<String>,
    },
    DeleteFile {
        file_id: String,
        filename: String,
    },
    UpdateAgent {
        vps_id: String,
        version: String,
        #[serde(default)]
        update_data: Value,
    },
    GetPlaylistStatus {
        stream_id: String,
    },
    GetCapabilities,
    Ping,
}

impl AgentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::StartStream { .. } => "START_STREAM",
            AgentCommand::StopStream { .. } => "STOP_STREAM",
            AgentCommand::UpdatePlaylist { .. } => "UPDATE_PLAYLIST",
            AgentCommand::SetLoopMode { .. } => "SET_LOOP_MODE",
            AgentCommand::SetPlaybackOrder { .. } => "SET_PLAYBACK_ORDER",
            AgentCommand::AddVideos { .. } => "ADD_VIDEOS",
            AgentCommand::DeleteVideos { .. } => "DELETE_VIDEOS",
            AgentCommand::DeleteFile { .. } => "DELETE_FILE",
            AgentCommand::UpdateAgent { .. } => "UPDATE_AGENT",
            AgentCommand::GetPlaylistStatus { .. } => "GET_PLAYLIST_STATUS",
            AgentCommand::GetCapabilities => "GET_CAPABILITIES",
            AgentCommand::Ping => "PING",
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        match self {
            AgentCommand::StartStream { stream_id, .. }
            | AgentCommand::StopStream { stream_id }
            | AgentCommand::UpdatePlaylist { stream_id, .. }
            | AgentCommand::SetLoopMode { stream_id, .. }
            | AgentCommand::SetPlaybackOrder { stream_id, .. }
            | AgentCommand::AddVideos { stream_id, .. }
            | AgentCommand::DeleteVideos { stream_id, .. }
            | AgentCommand::GetPlaylistStatus { stream_id } => Some(stream_id),
            AgentCommand::DeleteFile { .. }
            | AgentCommand::UpdateAgent { .. }
            | AgentCommand::GetCapabilities
            | AgentCommand::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Periodic liveness report published by every node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub vps_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub active_streams: Vec<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}
