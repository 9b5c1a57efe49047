use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    StartStream,
    StopStream,
    UpdateStream,
    RestartStream,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::StartStream => "START_STREAM",
            OperationKind::StopStream => "STOP_STREAM",
            OperationKind::UpdateStream => "UPDATE_STREAM",
            OperationKind::RestartStream => "RESTART_STREAM",
        }
    }

    /// Stop always outranks start so a queued start cannot starve it.
    pub fn base_priority(&self) -> i64 {
        match self {
            OperationKind::StopStream => 100,
            OperationKind::StartStream => 90,
            OperationKind::RestartStream => 85,
            OperationKind::UpdateStream => 80,
        }
    }

    /// Kinds that may not be queued or processing when `self` is admitted.
    pub fn conflicts_with(&self) -> &'static [OperationKind] {
        match self {
            OperationKind::StartStream | OperationKind::StopStream | OperationKind::UpdateStream => {
                &[OperationKind::StartStream, OperationKind::StopStream]
            }
            OperationKind::RestartStream => &[],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "START_STREAM" | "START" => Ok(OperationKind::StartStream),
            "STOP_STREAM" | "STOP" => Ok(OperationKind::StopStream),
            "UPDATE_STREAM" | "UPDATE" => Ok(OperationKind::UpdateStream),
            "RESTART_STREAM" | "RESTART" => Ok(OperationKind::RestartStream),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub job_id: String,
    pub kind: OperationKind,
    pub priority: i64,
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Earliest time a retried operation may be picked up again.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|at| at <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub job_id: String,
    pub processing: Option<Operation>,
    /// Highest priority first.
    pub queued: Vec<Operation>,
    /// Most recent first.
    pub history: Vec<Operation>,
}

/// `min(2^retry_count * base, cap)` seconds.
pub fn backoff_delay_seconds(retry_count: u32, base: i64, cap: i64) -> i64 {
    if retry_count >= 32 {
        return cap;
    }
    (1_i64 << retry_count).saturating_mul(base).min(cap)
}
