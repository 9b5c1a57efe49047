use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::remote::{RemoteError, RemoteExecutor};

use super::models::{Node, NodeTelemetry};

/// Prints one `key=value` line per reading.
pub const TELEMETRY_SCRIPT: &str = concat!(
    "echo disk_percent=$(df -P / | awk 'NR==2 {gsub(\"%\",\"\",$5); print $5}'); ",
    "echo disk_avail_kb=$(df -P / | awk 'NR==2 {print $4}'); ",
    "echo cpu_percent=$(top -bn1 | awk '/Cpu\\(s\\)/ {print 100-$8; exit}'); ",
    "echo ram_percent=$(free | awk '/Mem:/ {printf \"%.1f\", $3/$2*100}'); ",
    "echo network_mbps=$(cat /sys/class/net/$(ip route show default | awk '{print $5; exit}')/speed 2>/dev/null || echo 1000)"
);

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("telemetry output missing {0}")]
    MissingField(&'static str),
}

#[async_trait]
pub trait TelemetryProbe: Send + Sync {
    async fn probe(&self, node: &Node) -> Result<NodeTelemetry, TelemetryError>;
}

pub struct SshTelemetryProbe {
    remote: Arc<dyn RemoteExecutor>,
}

impl fmt::Debug for SshTelemetryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTelemetryProbe").finish_non_exhaustive()
    }
}

impl SshTelemetryProbe {
    pub fn new(remote: Arc<dyn RemoteExecutor>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl TelemetryProbe for SshTelemetryProbe {
    async fn probe(&self, node: &Node) -> Result<NodeTelemetry, TelemetryError> {
        let output = self.remote.execute_checked(node, TELEMETRY_SCRIPT).await?;
        parse_telemetry(&output.stdout)
    }
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([a-z_]+)=([0-9]+(?:\.[0-9]+)?)\s*$").expect("valid telemetry regex")
    })
}

pub fn parse_telemetry(output: &str) -> Result<NodeTelemetry, TelemetryError> {
    let values: HashMap<&str, f64> = output
        .lines()
        .filter_map(|line| {
            let captures = line_pattern().captures(line)?;
            let key = captures.get(1)?.as_str();
            let value = captures.get(2)?.as_str().parse::<f64>().ok()?;
            Some((key, value))
        })
        .collect();
    let field = |name: &'static str| {
        values
            .get(name)
            .copied()
            .ok_or(TelemetryError::MissingField(name))
    };
    Ok(NodeTelemetry {
        disk_percent: field("disk_percent")?,
        available_disk_gb: field("disk_avail_kb")? / (1024.0 * 1024.0),
        cpu_percent: field("cpu_percent")?,
        ram_percent: field("ram_percent")?,
        network_mbps: values.get("network_mbps").copied().unwrap_or(0.0),
    })
}
