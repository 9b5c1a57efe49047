use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{PlaybackOrder, PlaylistFile, StreamConfig};
use crate::fleet::{PlacementRequest, StreamingStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Starting,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Starting => "STARTING",
            JobStatus::Streaming => "STREAMING",
            JobStatus::Stopping => "STOPPING",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    /// Node currently holding a downloaded copy, if any.
    #[serde(default)]
    pub downloaded_to_node: Option<String>,
}

impl MediaFile {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        url: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            url: url.into(),
            size_bytes,
            downloaded_to_node: None,
        }
    }

    fn playlist_entry(&self) -> PlaylistFile {
        PlaylistFile {
            file_id: self.id.clone(),
            filename: self.filename.clone(),
            url: self.url.clone(),
            local_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamJob {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub source: MediaFile,
    /// Files after `source` in playlist order.
    #[serde(default)]
    pub playlist: Vec<MediaFile>,
    #[serde(default)]
    pub loop_enabled: bool,
    #[serde(default)]
    pub playlist_order: PlaybackOrder,
    pub destinations: Vec<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamJob {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
        source: MediaFile,
        destinations: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            source,
            playlist: Vec::new(),
            loop_enabled: false,
            playlist_order: PlaybackOrder::Sequential,
            destinations,
            status: JobStatus::Queued,
            node_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn placement_request(&self) -> PlacementRequest {
        PlacementRequest {
            job_id: self.id.clone(),
            source_url: self.source.url.clone(),
            file_size_bytes: self.source.size_bytes,
        }
    }

    pub fn playlist_files(&self) -> Vec<PlaylistFile> {
        std::iter::once(&self.source)
            .chain(self.playlist.iter())
            .map(MediaFile::playlist_entry)
            .collect()
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            title: self.title.clone(),
            files: self.playlist_order.arrange(&self.playlist_files()),
            rtmp_endpoints: self.destinations.clone(),
            loop_enabled: self.loop_enabled,
            playlist_order: self.playlist_order,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    Active,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// No transitions leave these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: String,
    pub job_id: String,
    pub node_id: String,
    pub strategy: StreamingStrategy,
    pub status: SessionStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub local_path: Option<String>,
    /// Exact remote command used to launch the worker process.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub fell_back: bool,
    #[serde(default)]
    pub handover_from: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartKind {
    Fresh,
    Handover { from_node: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Terminate,
    /// The job lives on elsewhere; load counters were already moved.
    Handover,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartReport {
    pub session_id: String,
    pub job_id: String,
    pub node_id: String,
    pub strategy: StreamingStrategy,
    pub fell_back: bool,
    pub blocked_destinations: Vec<String>,
    /// The job already had an active session; nothing was started.
    pub already_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupSummary {
    pub session_id: String,
    pub node_id: String,
    pub process_terminated: bool,
    pub forced_kill: bool,
    pub file_deleted: bool,
    pub bytes_freed: u64,
    pub temp_swept: bool,
    pub warnings: Vec<String>,
}
