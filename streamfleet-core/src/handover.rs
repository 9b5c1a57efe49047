//! Zero-downtime agent updates.
//!
//! A node with no active sessions is updated directly. Otherwise its
//! sessions are relocated to a single node with enough spare capacity, and
//! the update only proceeds once a later check confirms the relocated
//! sessions are ACTIVE. If no such node exists the update is deferred;
//! live streams are never interrupted for an update.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentClient, AgentCommand, BusError, Delivery};
use crate::clock::Clock;
use crate::config::HandoverSection;
use crate::fleet::{
    Node, NodeRegistry, NodeStatus, PlacementPlanner, RegistryError, StreamingStrategy,
};
use crate::lifecycle::{
    JobStatus, LifecycleError, StartKind, StopKind, StreamLifecycleManager, StreamSession,
};
use crate::store::{get_record, put_record, SharedStore, StoreError};
use crate::timers::{TimerKind, TimerQueue};

#[derive(Debug, Error)]
pub enum HandoverError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type HandoverResult<T> = Result<T, HandoverError>;

fn context_key(node_id: &str) -> String {
    format!("vps_handover:{node_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub version: String,
    #[serde(default)]
    pub update_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedSession {
    pub job_id: String,
    pub previous_session_id: String,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverContext {
    pub source_node: String,
    pub destination_node: String,
    pub sessions: Vec<MigratedSession>,
    pub update: UpdateRequest,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Update command delivered; completion is checked later.
    Updating { node_id: String },
    HandoverStarted {
        source: String,
        destination: String,
        migrated: Vec<String>,
        failed: Vec<String>,
    },
    /// Nothing was changed; try again after `retry_after` seconds.
    Deferred { retry_after: i64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum HandoverCheck {
    Completed { outcome: UpdateOutcome },
    Pending { unverified: Vec<String> },
    /// The context timed out, vanished, or the source node changed status
    /// underneath it. No update was sent.
    Expired,
}

pub struct GracefulAgentUpdate {
    store: Arc<dyn SharedStore>,
    registry: NodeRegistry,
    lifecycle: Arc<StreamLifecycleManager>,
    planner: Arc<PlacementPlanner>,
    agent: AgentClient,
    timers: TimerQueue,
    clock: Arc<dyn Clock>,
    config: HandoverSection,
}

impl fmt::Debug for GracefulAgentUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulAgentUpdate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GracefulAgentUpdate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: NodeRegistry,
        lifecycle: Arc<StreamLifecycleManager>,
        planner: Arc<PlacementPlanner>,
        agent: AgentClient,
        timers: TimerQueue,
        clock: Arc<dyn Clock>,
        config: HandoverSection,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            planner,
            agent,
            timers,
            clock,
            config,
        }
    }

    /// Only ACTIVE or ERROR nodes without a running handover are updated;
    /// anything else is deferred untouched.
    pub async fn initiate_update(
        &self,
        node_id: &str,
        request: UpdateRequest,
    ) -> HandoverResult<UpdateOutcome> {
        let node = self.registry.require(node_id)?;
        // ERROR is accepted so a failed update can be retried.
        if !matches!(node.status, NodeStatus::Active | NodeStatus::Error) {
            return Ok(self.refuse(&node.id, format!("node {} is {}", node.id, node.status)));
        }
        if self.context(node_id)?.is_some() {
            return Ok(self.refuse(&node.id, format!("handover already running for {}", node.id)));
        }
        let sessions = self
            .lifecycle
            .repository()
            .active_sessions(Some(node_id))?;
        if sessions.is_empty() {
            return self.direct_update(&node, &request).await;
        }
        self.graceful_update(&node, sessions, request).await
    }

    /// Least-loaded other ACTIVE node with a fresh heartbeat and at least
    /// `required` spare slots. Ties go to the earliest registered node.
    pub fn find_handover_target(&self, source: &str, required: usize) -> HandoverResult<Option<Node>> {
        let now = self.clock.now();
        let window = Duration::seconds(self.config.heartbeat_window_seconds);
        let mut best: Option<Node> = None;
        for node in self.registry.list_by_status(NodeStatus::Active)? {
            if node.id == source
                || !node.heartbeat_within(now, window)
                || node.spare_capacity() < required as i64
            {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |current| node.current_streams < current.current_streams)
            {
                best = Some(node);
            }
        }
        Ok(best)
    }

    pub fn context(&self, node_id: &str) -> HandoverResult<Option<HandoverContext>> {
        Ok(get_record(self.store.as_ref(), &context_key(node_id))?)
    }

    /// Verifies a running handover. Once every relocated session is ACTIVE
    /// and the source runs nothing, the source is updated directly.
    pub async fn check_handover(&self, node_id: &str) -> HandoverResult<HandoverCheck> {
        let Some(context) = self.context(node_id)? else {
            self.revert_preparing(node_id, "handover context expired")?;
            return Ok(HandoverCheck::Expired);
        };

        let mut unverified = Vec::new();
        for migrated in &context.sessions {
            let active = match &migrated.new_session_id {
                Some(id) => self.lifecycle.session_is_active(id)?,
                None => false,
            };
            if !active {
                unverified.push(migrated.job_id.clone());
            }
        }
        let remaining = self
            .lifecycle
            .repository()
            .active_sessions(Some(node_id))?;

        if unverified.is_empty() && remaining.is_empty() {
            self.store.delete(&context_key(node_id))?;
            let node = self.registry.require(node_id)?;
            if node.status != NodeStatus::PreparingUpdate {
                warn!(node_id = %node_id, status = %node.status, "node left PREPARING_UPDATE, update skipped");
                return Ok(HandoverCheck::Expired);
            }
            let outcome = self.direct_update(&node, &context.update).await?;
            if matches!(outcome, UpdateOutcome::Deferred { .. }) {
                self.revert_preparing(node_id, "agent not listening for update")?;
            }
            info!(node_id = %node_id, "handover verified, proceeding with update");
            return Ok(HandoverCheck::Completed { outcome });
        }

        let now = self.clock.now();
        if now - context.started_at >= Duration::seconds(self.config.update_timeout_seconds) {
            self.store.delete(&context_key(node_id))?;
            self.revert_preparing(node_id, "handover did not complete in time")?;
            return Ok(HandoverCheck::Expired);
        }
        for session in &remaining {
            if !unverified.contains(&session.job_id) {
                unverified.push(session.job_id.clone());
            }
        }
        self.timers.schedule(
            TimerKind::HandoverCheck {
                node_id: node_id.to_string(),
            },
            now + Duration::seconds(self.config.handover_grace_seconds),
        )?;
        info!(node_id = %node_id, pending = unverified.len(), "handover not yet verified");
        Ok(HandoverCheck::Pending { unverified })
    }

    /// Fired after the direct-update delay. A node still UPDATING never
    /// reported back and is marked ERROR. Returns whether that happened.
    pub fn check_update_completion(&self, node_id: &str) -> HandoverResult<bool> {
        let Some(node) = self.registry.get(node_id)? else {
            return Ok(false);
        };
        if node.status != NodeStatus::Updating {
            return Ok(false);
        }
        self.registry
            .mark_error(node_id, "agent update did not report completion")?;
        warn!(node_id = %node_id, "agent update timed out");
        Ok(true)
    }

    /// Callback for a node reporting the result of its own update.
    pub fn handle_update_completion(
        &self,
        node_id: &str,
        success: bool,
        message: Option<&str>,
        version: Option<&str>,
    ) -> HandoverResult<Node> {
        let node = if success {
            self.registry.mark_active(node_id, version)?
        } else {
            self.registry
                .mark_error(node_id, message.unwrap_or("agent update failed"))?
        };
        self.store.delete(&context_key(node_id))?;
        self.timers.cancel_for_node(node_id)?;
        info!(node_id = %node_id, success, status = %node.status, "agent update completed");
        Ok(node)
    }

    async fn direct_update(&self, node: &Node, request: &UpdateRequest) -> HandoverResult<UpdateOutcome> {
        let previous = node.status;
        self.registry.set_status(&node.id, NodeStatus::Updating)?;
        let command = AgentCommand::UpdateAgent {
            vps_id: node.id.clone(),
            version: request.version.clone(),
            update_data: request.update_data.clone(),
        };
        if self.agent.send(&node.id, &command).await? == Delivery::NoListeners {
            self.registry.set_status(&node.id, previous)?;
            return Ok(UpdateOutcome::Deferred {
                retry_after: self.config.retry_after_seconds,
                reason: format!("agent on {} is not listening", node.id),
            });
        }
        self.timers.schedule(
            TimerKind::UpdateCompletionCheck {
                node_id: node.id.clone(),
                version: request.version.clone(),
            },
            self.clock.now() + Duration::seconds(self.config.update_check_delay_seconds),
        )?;
        info!(node_id = %node.id, version = %request.version, "agent update dispatched");
        Ok(UpdateOutcome::Updating {
            node_id: node.id.clone(),
        })
    }

    async fn graceful_update(
        &self,
        source: &Node,
        sessions: Vec<StreamSession>,
        request: UpdateRequest,
    ) -> HandoverResult<UpdateOutcome> {
        let Some(destination) = self.find_handover_target(&source.id, sessions.len())? else {
            warn!(
                node_id = %source.id,
                sessions = sessions.len(),
                "no node can absorb the sessions, update deferred"
            );
            return Ok(UpdateOutcome::Deferred {
                retry_after: self.config.retry_after_seconds,
                reason: format!(
                    "no active node with {} spare slots for handover",
                    sessions.len()
                ),
            });
        };

        self.registry
            .set_status(&source.id, NodeStatus::PreparingUpdate)?;
        let mut context = HandoverContext {
            source_node: source.id.clone(),
            destination_node: destination.id.clone(),
            sessions: sessions
                .iter()
                .map(|session| MigratedSession {
                    job_id: session.job_id.clone(),
                    previous_session_id: session.id.clone(),
                    new_session_id: None,
                    error: None,
                })
                .collect(),
            update: request,
            started_at: self.clock.now(),
        };
        self.save_context(&context)?;

        let stagger = std::time::Duration::from_millis(self.config.stagger_millis);
        for (index, session) in sessions.iter().enumerate() {
            if index > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let result = self.migrate_session(session, source, &destination).await?;
            let entry = &mut context.sessions[index];
            match result {
                Ok(new_session_id) => entry.new_session_id = Some(new_session_id),
                Err(reason) => entry.error = Some(reason),
            }
        }
        self.save_context(&context)?;

        let migrated: Vec<String> = context
            .sessions
            .iter()
            .filter(|entry| entry.new_session_id.is_some())
            .map(|entry| entry.job_id.clone())
            .collect();
        let failed: Vec<String> = context
            .sessions
            .iter()
            .filter(|entry| entry.error.is_some())
            .map(|entry| entry.job_id.clone())
            .collect();

        if migrated.is_empty() {
            self.store.delete(&context_key(&source.id))?;
            self.revert_preparing(&source.id, "no session could be relocated")?;
            return Ok(UpdateOutcome::Deferred {
                retry_after: self.config.retry_after_seconds,
                reason: format!("handover to {} failed for every session", destination.id),
            });
        }

        self.timers.schedule(
            TimerKind::HandoverCheck {
                node_id: source.id.clone(),
            },
            self.clock.now() + Duration::seconds(self.config.handover_grace_seconds),
        )?;
        info!(
            node_id = %source.id,
            destination = %destination.id,
            migrated = migrated.len(),
            failed = failed.len(),
            "handover started"
        );
        Ok(UpdateOutcome::HandoverStarted {
            source: source.id.clone(),
            destination: destination.id.clone(),
            migrated,
            failed,
        })
    }

    /// Relocates one session. The inner `Err` carries a per-session failure
    /// that leaves the original session running on the source.
    async fn migrate_session(
        &self,
        session: &StreamSession,
        source: &Node,
        destination: &Node,
    ) -> HandoverResult<Result<String, String>> {
        let repository = self.lifecycle.repository();
        let Some(mut job) = repository.job(&session.job_id)? else {
            return Ok(Err(format!("job {} not found", session.job_id)));
        };
        job.node_id = Some(destination.id.clone());
        job.status = JobStatus::Starting;
        job.updated_at = self.clock.now();
        repository.save_job(&job)?;
        self.registry.decrement_load(&source.id)?;
        self.registry.increment_load(&destination.id)?;
        info!(
            event = "handover",
            job_id = %job.id,
            from = %source.id,
            to = %destination.id,
            "stream reassigned"
        );

        let destination = self.registry.require(&destination.id)?;
        let strategy = match self
            .planner
            .plan_for_node(&destination, &job.placement_request())
            .await
        {
            Ok(plan) => plan.strategy,
            Err(error) => {
                warn!(job_id = %job.id, %error, "handover planning failed, using url streaming");
                StreamingStrategy::UrlStreaming
            }
        };

        let start = self
            .lifecycle
            .start_on_node(
                &job,
                &destination,
                strategy,
                StartKind::Handover {
                    from_node: source.id.clone(),
                },
            )
            .await;
        match start {
            Ok(report) => {
                if let Err(error) = self
                    .lifecycle
                    .stop_session(&session.id, "handover", StopKind::Handover)
                    .await
                {
                    warn!(session_id = %session.id, %error, "stopping handed-over session failed");
                }
                Ok(Ok(report.session_id))
            }
            Err(error) => {
                warn!(
                    event = "handover",
                    job_id = %job.id,
                    to = %destination.id,
                    %error,
                    "handover start failed, reverting"
                );
                self.registry.decrement_load(&destination.id)?;
                self.registry.increment_load(&source.id)?;
                if let Some(mut job) = repository.job(&session.job_id)? {
                    job.node_id = Some(source.id.clone());
                    job.status = JobStatus::Streaming;
                    job.updated_at = self.clock.now();
                    repository.save_job(&job)?;
                }
                repository.set_active_session(&session.job_id, &session.id)?;
                Ok(Err(error.to_string()))
            }
        }
    }

    fn save_context(&self, context: &HandoverContext) -> HandoverResult<()> {
        let expires_at = context.started_at + Duration::seconds(self.config.update_timeout_seconds);
        let ttl = (expires_at - self.clock.now()).max(Duration::seconds(1));
        put_record(
            self.store.as_ref(),
            &context_key(&context.source_node),
            context,
            Some(ttl),
        )?;
        Ok(())
    }

    fn refuse(&self, node_id: &str, reason: String) -> UpdateOutcome {
        warn!(node_id = %node_id, %reason, "update refused");
        UpdateOutcome::Deferred {
            retry_after: self.config.retry_after_seconds,
            reason,
        }
    }

    fn revert_preparing(&self, node_id: &str, reason: &str) -> HandoverResult<()> {
        if let Some(node) = self.registry.get(node_id)? {
            if node.status == NodeStatus::PreparingUpdate {
                self.registry.set_status(node_id, NodeStatus::Active)?;
                warn!(node_id = %node_id, reason, "update abandoned, node back to ACTIVE");
            }
        }
        Ok(())
    }
}
