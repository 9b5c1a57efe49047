use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Active,
    Updating,
    PreparingUpdate,
    Decommissioning,
    Failed,
    Replaced,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Active => "ACTIVE",
            NodeStatus::Updating => "UPDATING",
            NodeStatus::PreparingUpdate => "PREPARING_UPDATE",
            NodeStatus::Decommissioning => "DECOMMISSIONING",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Replaced => "REPLACED",
            NodeStatus::Error => "ERROR",
        }
    }

    /// Nodes in these states are never reused for new placements.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Failed | NodeStatus::Replaced | NodeStatus::Decommissioning
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(NodeStatus::Pending),
            "ACTIVE" => Ok(NodeStatus::Active),
            "UPDATING" => Ok(NodeStatus::Updating),
            "PREPARING_UPDATE" => Ok(NodeStatus::PreparingUpdate),
            "DECOMMISSIONING" => Ok(NodeStatus::Decommissioning),
            "FAILED" => Ok(NodeStatus::Failed),
            "REPLACED" => Ok(NodeStatus::Replaced),
            "ERROR" => Ok(NodeStatus::Error),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// A worker VPS. `current_streams` is backed by a separate counter in the
/// shared store and filled in by the registry on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub host: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub status: NodeStatus,
    pub max_concurrent_streams: u32,
    #[serde(default)]
    pub current_streams: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub agent_version: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>, host: impl Into<String>, max_concurrent_streams: u32) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            status: NodeStatus::Pending,
            max_concurrent_streams,
            current_streams: 0,
            last_heartbeat_at: None,
            agent_version: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn spare_capacity(&self) -> i64 {
        self.max_concurrent_streams as i64 - self.current_streams
    }

    pub fn heartbeat_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_heartbeat_at
            .map(|at| now - at <= window)
            .unwrap_or(false)
    }

    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.ssh_user, self.host)
    }
}

/// Live resource readings. Never cached on the node record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    pub available_disk_gb: f64,
    pub network_mbps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamingStrategy {
    /// Stream straight from the source URL; nothing is written to the node's disk.
    UrlStreaming,
    /// Fetch the source to local disk first, then stream the local copy.
    DownloadStreaming,
}

impl StreamingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingStrategy::UrlStreaming => "URL_STREAMING",
            StreamingStrategy::DownloadStreaming => "DOWNLOAD_STREAMING",
        }
    }
}

impl fmt::Display for StreamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl DiskPressure {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 90.0 {
            DiskPressure::Critical
        } else if percent >= 75.0 {
            DiskPressure::High
        } else if percent >= 50.0 {
            DiskPressure::Medium
        } else {
            DiskPressure::Low
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub total_nodes: usize,
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub active_capacity: i64,
    pub active_load: i64,
}
