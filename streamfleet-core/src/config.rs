use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FleetConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub operations: OperationsSection,
    #[serde(default)]
    pub placement: PlacementSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub handover: HandoverSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

impl FleetConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.store.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub base_dir: String,
    pub database: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            database: "fleet.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_seconds: i64,
    pub half_open_timeout_seconds: i64,
    pub state_ttl_seconds: i64,
    pub probe_timeout_seconds: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_seconds: 300,
            half_open_timeout_seconds: 60,
            state_ttl_seconds: 3600,
            probe_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationsSection {
    pub queue_ttl_seconds: i64,
    pub processing_ttl_seconds: i64,
    pub max_retries: u32,
    pub history_limit: usize,
    pub history_ttl_seconds: i64,
    pub backoff_base_seconds: i64,
    pub backoff_cap_seconds: i64,
}

impl Default for OperationsSection {
    fn default() -> Self {
        Self {
            queue_ttl_seconds: 300,
            processing_ttl_seconds: 300,
            max_retries: 3,
            history_limit: 100,
            history_ttl_seconds: 86_400,
            backoff_base_seconds: 5,
            backoff_cap_seconds: 60,
        }
    }
}

/// Which disk figure picks the streaming strategy.
///
/// `Primary` categorizes the primary candidate's own usage. `FleetAverage`
/// uses the mean over every analyzed candidate and is the default. The two
/// disagree when a quiet node ranks first in a crowded fleet: a 3 GB file
/// placed on a 20% node next to a 92% node downloads under `Primary` but
/// streams from URL under `FleetAverage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureBasis {
    FleetAverage,
    Primary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlacementSection {
    pub small_file_mb: u64,
    pub medium_file_mb: u64,
    pub backup_count: usize,
    pub pressure_basis: PressureBasis,
}

impl Default for PlacementSection {
    fn default() -> Self {
        Self {
            small_file_mb: 500,
            medium_file_mb: 2048,
            backup_count: 2,
            pressure_basis: PressureBasis::FleetAverage,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub ffmpeg_path: String,
    pub download_dir: String,
    pub temp_dir: String,
    pub log_dir: String,
    pub kill_grace_seconds: u64,
    pub download_timeout_seconds: u64,
    pub video_codec: String,
    pub video_preset: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub keyframe_interval: u32,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            download_dir: "/opt/streamfleet/downloads".to_string(),
            temp_dir: "/tmp/streamfleet".to_string(),
            log_dir: "/var/log/streamfleet".to_string(),
            kill_grace_seconds: 3,
            download_timeout_seconds: 1800,
            video_codec: "copy".to_string(),
            video_preset: "veryfast".to_string(),
            video_bitrate: "4500k".to_string(),
            audio_bitrate: "128k".to_string(),
            keyframe_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoverSection {
    pub heartbeat_window_seconds: i64,
    pub update_timeout_seconds: i64,
    pub handover_grace_seconds: i64,
    pub update_check_delay_seconds: i64,
    pub retry_after_seconds: i64,
    pub stagger_millis: u64,
}

impl Default for HandoverSection {
    fn default() -> Self {
        Self {
            heartbeat_window_seconds: 120,
            update_timeout_seconds: 300,
            handover_grace_seconds: 60,
            update_check_delay_seconds: 120,
            retry_after_seconds: 300,
            stagger_millis: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub command_channel_prefix: String,
    pub heartbeat_channel: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command_channel_prefix: "vps-commands".to_string(),
            heartbeat_channel: "vps-heartbeats".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub ssh_binary: String,
    pub scp_binary: String,
    pub connect_timeout_seconds: u64,
    pub identity_file: Option<String>,
    pub strict_host_key_checking: bool,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
            connect_timeout_seconds: 10,
            identity_file: None,
            strict_host_key_checking: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub tick_interval_seconds: u64,
    pub reconcile_interval_seconds: i64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 5,
            reconcile_interval_seconds: 600,
        }
    }
}

pub fn load_fleet_config<P: AsRef<Path>>(path: P) -> Result<FleetConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
