pub mod agent;
pub mod breaker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod fleet;
pub mod handover;
pub mod lifecycle;
pub mod operations;
pub mod remote;
pub mod services;
pub mod sqlite;
pub mod store;
pub mod supervisor;
pub mod timers;
pub mod worker;

pub use agent::{
    AgentClient, AgentCommand, BusError, CommandBus, Delivery, Heartbeat, InMemoryBus,
    PlaybackOrder, PlaylistFile, StreamConfig,
};
pub use breaker::{BreakerError, CircuitRecord, CircuitState, RtmpCircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_record, encode_record, CodecError, RECORD_VERSION};
pub use config::{load_fleet_config, FleetConfig, PressureBasis};
pub use error::{ConfigError, Result};
pub use fleet::{
    DiskPressure, DistributionPlan, FleetSummary, Node, NodeCandidate, NodeRegistry, NodeStatus,
    NodeTelemetry, PlacementError, PlacementPlanner, PlacementRequest, RegistryError,
    SshTelemetryProbe, StreamingStrategy, TelemetryError, TelemetryProbe,
};
pub use handover::{
    GracefulAgentUpdate, HandoverCheck, HandoverContext, HandoverError, UpdateOutcome,
    UpdateRequest,
};
pub use lifecycle::{
    CleanupSummary, JobStatus, LifecycleError, LifecycleRepository, MediaFile, SessionStatus,
    StartKind, StartReport, StopKind, StreamJob, StreamLifecycleManager, StreamSession,
};
pub use operations::{
    Operation, OperationError, OperationKind, OperationStatus, QueueStatus, StreamOperationQueue,
};
pub use remote::{CommandExecutor, CommandOutput, RemoteError, RemoteExecutor, SshExecutor};
pub use services::FleetServices;
pub use store::{MemoryStore, SharedStore, SqliteStore, SqliteStoreBuilder, StoreError};
pub use supervisor::{LoadAdjustment, Supervisor, SupervisorError, TickReport};
pub use timers::{Timer, TimerKind, TimerQueue};
pub use worker::{OperationWorker, PlaylistUpdate, WorkOutcome, WorkerError};
