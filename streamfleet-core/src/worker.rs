use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentClient, AgentCommand, BusError, Delivery, PlaybackOrder};
use crate::fleet::{PlacementError, PlacementPlanner};
use crate::lifecycle::{LifecycleError, MediaFile, StartReport, StreamLifecycleManager};
use crate::operations::{Operation, OperationError, OperationKind, StreamOperationQueue};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("operation queue error: {0}")]
    Operation(#[from] OperationError),
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid operation payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("stream job {0} not found")]
    JobNotFound(String),
    #[error("agent on node {0} is not listening")]
    AgentUnavailable(String),
}

/// Payload of an UPDATE_STREAM operation. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistUpdate {
    #[serde(default)]
    pub playlist: Option<Vec<MediaFile>>,
    #[serde(default)]
    pub loop_enabled: Option<bool>,
    #[serde(default)]
    pub playlist_order: Option<PlaybackOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkOutcome {
    pub operation_id: String,
    pub kind: OperationKind,
    pub success: bool,
    pub will_retry: bool,
    pub message: String,
}

/// Drives admitted operations through placement and the lifecycle manager.
pub struct OperationWorker {
    queue: StreamOperationQueue,
    planner: Arc<PlacementPlanner>,
    lifecycle: Arc<StreamLifecycleManager>,
    agent: AgentClient,
}

impl fmt::Debug for OperationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationWorker").finish_non_exhaustive()
    }
}

impl OperationWorker {
    pub fn new(
        queue: StreamOperationQueue,
        planner: Arc<PlacementPlanner>,
        lifecycle: Arc<StreamLifecycleManager>,
        agent: AgentClient,
    ) -> Self {
        Self {
            queue,
            planner,
            lifecycle,
            agent,
        }
    }

    /// Executes the next admitted operation for `job_id`, if any, and
    /// records its outcome in the queue.
    pub async fn drive(&self, job_id: &str) -> Result<Option<WorkOutcome>, WorkerError> {
        let Some(operation) = self.queue.process_next(job_id)? else {
            return Ok(None);
        };
        let outcome = match self.execute(&operation).await {
            Ok(message) => {
                self.queue.mark_completed(job_id, &operation.id, true)?;
                info!(job_id = %job_id, kind = %operation.kind, %message, "operation completed");
                WorkOutcome {
                    operation_id: operation.id,
                    kind: operation.kind,
                    success: true,
                    will_retry: false,
                    message,
                }
            }
            Err(err) => {
                let message = err.to_string();
                let will_retry = self.queue.mark_failed(job_id, &operation.id, &message)?;
                warn!(job_id = %job_id, kind = %operation.kind, %message, will_retry, "operation failed");
                WorkOutcome {
                    operation_id: operation.id,
                    kind: operation.kind,
                    success: false,
                    will_retry,
                    message,
                }
            }
        };
        Ok(Some(outcome))
    }

    async fn execute(&self, operation: &Operation) -> Result<String, WorkerError> {
        let job_id = operation.job_id.as_str();
        match operation.kind {
            OperationKind::StartStream => {
                let report = self.start(job_id).await?;
                Ok(describe_start(&report))
            }
            OperationKind::StopStream => {
                let reason = operation
                    .payload
                    .get("reason")
                    .and_then(|value| value.as_str())
                    .unwrap_or("stop requested");
                match self.lifecycle.stop_job(job_id, reason).await? {
                    Some(summary) => Ok(format!(
                        "stopped session {} on {} ({} bytes freed)",
                        summary.session_id, summary.node_id, summary.bytes_freed
                    )),
                    None => Ok("no active session".to_string()),
                }
            }
            OperationKind::RestartStream => {
                self.lifecycle.stop_job(job_id, "restart").await?;
                let report = self.start(job_id).await?;
                Ok(format!("restarted: {}", describe_start(&report)))
            }
            OperationKind::UpdateStream => {
                let update: PlaylistUpdate = if operation.payload.is_null() {
                    PlaylistUpdate::default()
                } else {
                    serde_json::from_value(operation.payload.clone())?
                };
                self.update(job_id, update).await
            }
        }
    }

    async fn start(&self, job_id: &str) -> Result<StartReport, WorkerError> {
        let job = self
            .lifecycle
            .repository()
            .job(job_id)?
            .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))?;
        let plan = self
            .planner
            .distribute_stream(&job.placement_request())
            .await?;
        Ok(self.lifecycle.start_stream(job_id, &plan).await?)
    }

    async fn update(&self, job_id: &str, update: PlaylistUpdate) -> Result<String, WorkerError> {
        let repository = self.lifecycle.repository();
        let mut job = repository
            .job(job_id)?
            .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))?;
        if let Some(playlist) = update.playlist.clone() {
            job.playlist = playlist;
        }
        if let Some(enabled) = update.loop_enabled {
            job.loop_enabled = enabled;
        }
        if let Some(order) = update.playlist_order {
            job.playlist_order = order;
        }
        repository.save_job(&job)?;

        let Some(session) = repository.active_session(job_id)? else {
            return Ok("job updated, no active session to notify".to_string());
        };
        let mut commands = Vec::new();
        if update.playlist.is_some() {
            commands.push(AgentCommand::UpdatePlaylist {
                stream_id: job_id.to_string(),
                files: job.playlist_order.arrange(&job.playlist_files()),
            });
        }
        if let Some(enabled) = update.loop_enabled {
            commands.push(AgentCommand::SetLoopMode {
                stream_id: job_id.to_string(),
                enabled,
            });
        }
        if let Some(order) = update.playlist_order {
            commands.push(AgentCommand::SetPlaybackOrder {
                stream_id: job_id.to_string(),
                order,
            });
        }
        for command in &commands {
            if self.agent.send(&session.node_id, command).await? == Delivery::NoListeners {
                return Err(WorkerError::AgentUnavailable(session.node_id.clone()));
            }
        }
        Ok(format!(
            "sent {} command(s) to {}",
            commands.len(),
            session.node_id
        ))
    }
}

fn describe_start(report: &StartReport) -> String {
    if report.already_active {
        return format!("already streaming on {}", report.node_id);
    }
    format!(
        "session {} on {} via {}{}",
        report.session_id,
        report.node_id,
        report.strategy,
        if report.fell_back { " (fallback)" } else { "" }
    )
}
