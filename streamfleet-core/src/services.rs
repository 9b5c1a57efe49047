use std::fmt;
use std::sync::Arc;

use crate::agent::{AgentClient, CommandBus};
use crate::breaker::RtmpCircuitBreaker;
use crate::clock::Clock;
use crate::config::FleetConfig;
use crate::fleet::{NodeRegistry, PlacementPlanner, TelemetryProbe};
use crate::handover::GracefulAgentUpdate;
use crate::lifecycle::{LifecycleRepository, StreamLifecycleManager};
use crate::operations::StreamOperationQueue;
use crate::remote::RemoteExecutor;
use crate::store::SharedStore;
use crate::supervisor::Supervisor;
use crate::timers::TimerQueue;
use crate::worker::OperationWorker;

/// Every component wired over one shared store.
#[derive(Clone)]
pub struct FleetServices {
    pub store: Arc<dyn SharedStore>,
    pub clock: Arc<dyn Clock>,
    pub registry: NodeRegistry,
    pub breaker: RtmpCircuitBreaker,
    pub queue: StreamOperationQueue,
    pub planner: Arc<PlacementPlanner>,
    pub lifecycle: Arc<StreamLifecycleManager>,
    pub agent: AgentClient,
    pub timers: TimerQueue,
    pub handover: Arc<GracefulAgentUpdate>,
    pub supervisor: Arc<Supervisor>,
    pub worker: Arc<OperationWorker>,
}

impl fmt::Debug for FleetServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetServices").finish_non_exhaustive()
    }
}

impl FleetServices {
    pub fn new(
        config: &FleetConfig,
        store: Arc<dyn SharedStore>,
        remote: Arc<dyn RemoteExecutor>,
        probe: Arc<dyn TelemetryProbe>,
        bus: Arc<dyn CommandBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = NodeRegistry::new(store.clone(), clock.clone());
        let breaker = RtmpCircuitBreaker::new(store.clone(), clock.clone(), config.breaker.clone());
        let queue =
            StreamOperationQueue::new(store.clone(), clock.clone(), config.operations.clone());
        let planner = Arc::new(PlacementPlanner::new(
            registry.clone(),
            probe,
            config.placement.clone(),
            clock.clone(),
        ));
        let repository = LifecycleRepository::new(store.clone());
        let lifecycle = Arc::new(StreamLifecycleManager::new(
            repository.clone(),
            registry.clone(),
            breaker.clone(),
            remote,
            clock.clone(),
            config.lifecycle.clone(),
        ));
        let agent = AgentClient::new(bus, config.agent.clone());
        let timers = TimerQueue::new(store.clone());
        let handover = Arc::new(GracefulAgentUpdate::new(
            store.clone(),
            registry.clone(),
            lifecycle.clone(),
            planner.clone(),
            agent.clone(),
            timers.clone(),
            clock.clone(),
            config.handover.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            registry.clone(),
            repository,
            handover.clone(),
            timers.clone(),
            agent.clone(),
            clock.clone(),
            config.supervisor.clone(),
        ));
        let worker = Arc::new(OperationWorker::new(
            queue.clone(),
            planner.clone(),
            lifecycle.clone(),
            agent.clone(),
        ));
        Self {
            store,
            clock,
            registry,
            breaker,
            queue,
            planner,
            lifecycle,
            agent,
            timers,
            handover,
            supervisor,
            worker,
        }
    }
}
