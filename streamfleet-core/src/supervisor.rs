use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentClient, BusError, Heartbeat};
use crate::clock::Clock;
use crate::config::SupervisorSection;
use crate::fleet::{NodeRegistry, RegistryError};
use crate::handover::{GracefulAgentUpdate, HandoverCheck, HandoverError};
use crate::lifecycle::LifecycleRepository;
use crate::store::{SharedStore, StoreError};
use crate::timers::{Timer, TimerKind, TimerQueue};

const RECONCILE_LOCK_KEY: &str = "fleet:reconcile_lock";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("handover error: {0}")]
    Handover(#[from] HandoverError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadAdjustment {
    pub node_id: String,
    pub recorded: i64,
    pub actual: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub timers_fired: usize,
    pub handover_checks: Vec<(String, HandoverCheck)>,
    pub nodes_marked_error: Vec<String>,
    pub load_adjustments: Option<Vec<LoadAdjustment>>,
}

/// Scans due timers, ingests heartbeats and periodically reconciles node
/// load counters against live sessions.
pub struct Supervisor {
    store: Arc<dyn SharedStore>,
    registry: NodeRegistry,
    repository: LifecycleRepository,
    handover: Arc<GracefulAgentUpdate>,
    timers: TimerQueue,
    agent: AgentClient,
    clock: Arc<dyn Clock>,
    config: SupervisorSection,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: NodeRegistry,
        repository: LifecycleRepository,
        handover: Arc<GracefulAgentUpdate>,
        timers: TimerQueue,
        agent: AgentClient,
        clock: Arc<dyn Clock>,
        config: SupervisorSection,
    ) -> Self {
        Self {
            store,
            registry,
            repository,
            handover,
            timers,
            agent,
            clock,
            config,
        }
    }

    /// One supervision pass. Individual timer failures are logged and do
    /// not abort the pass.
    pub async fn tick(&self) -> SupervisorResult<TickReport> {
        let mut report = TickReport::default();
        let due = self.timers.claim_due(self.clock.now())?;
        report.timers_fired = due.len();
        for timer in due {
            if let Err(err) = self.dispatch(&timer, &mut report).await {
                error!(timer_id = %timer.id, node_id = %timer.kind.node_id(), error = %err, "timer handler failed");
            }
        }

        let cadence = Duration::seconds(self.config.reconcile_interval_seconds.max(1));
        if self.store.set_nx(RECONCILE_LOCK_KEY, "1", Some(cadence))? {
            report.load_adjustments = Some(self.reconcile_loads()?);
        }
        Ok(report)
    }

    /// Recomputes every node's load counter from ACTIVE sessions.
    pub fn reconcile_loads(&self) -> SupervisorResult<Vec<LoadAdjustment>> {
        let counts = self.repository.active_counts_by_node()?;
        let mut adjustments = Vec::new();
        for node in self.registry.list()? {
            let actual = counts.get(&node.id).copied().unwrap_or(0);
            if node.current_streams != actual {
                warn!(
                    node_id = %node.id,
                    recorded = node.current_streams,
                    actual,
                    "load counter drift corrected"
                );
                self.registry.set_load(&node.id, actual)?;
                adjustments.push(LoadAdjustment {
                    node_id: node.id.clone(),
                    recorded: node.current_streams,
                    actual,
                });
            }
        }
        debug!(adjusted = adjustments.len(), "load reconciliation finished");
        Ok(adjustments)
    }

    /// Refreshes the node's heartbeat. Returns `false` for unknown nodes.
    pub fn ingest_heartbeat(&self, heartbeat: &Heartbeat) -> SupervisorResult<bool> {
        match self.registry.record_heartbeat(
            &heartbeat.vps_id,
            heartbeat.timestamp,
            heartbeat.agent_version.as_deref(),
        ) {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(id)) => {
                warn!(node_id = %id, "heartbeat from unregistered node");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Ticks on the configured interval and ingests heartbeats until
    /// `shutdown` resolves.
    pub async fn run_loop<S>(&self, shutdown: S) -> SupervisorResult<()>
    where
        S: Future<Output = ()>,
    {
        let mut heartbeats = self.agent.heartbeats().await?;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.tick_interval_seconds.max(1),
        ));
        tokio::pin!(shutdown);
        info!("supervisor started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.tick().await?;
                    if report.timers_fired > 0 {
                        info!(timers = report.timers_fired, "supervisor tick");
                    }
                }
                Some(heartbeat) = heartbeats.next() => {
                    self.ingest_heartbeat(&heartbeat)?;
                }
            }
        }
        info!("supervisor stopped");
        Ok(())
    }

    async fn dispatch(&self, timer: &Timer, report: &mut TickReport) -> SupervisorResult<()> {
        match &timer.kind {
            TimerKind::HandoverCheck { node_id } => {
                let check = self.handover.check_handover(node_id).await?;
                report.handover_checks.push((node_id.clone(), check));
            }
            TimerKind::UpdateCompletionCheck { node_id, version } => {
                if self.handover.check_update_completion(node_id)? {
                    warn!(node_id = %node_id, version = %version, "update completion check failed the node");
                    report.nodes_marked_error.push(node_id.clone());
                }
            }
        }
        Ok(())
    }
}
