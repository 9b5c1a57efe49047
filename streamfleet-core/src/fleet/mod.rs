pub mod models;
pub mod planner;
pub mod registry;
pub mod telemetry;

pub use models::{
    DiskPressure, FleetSummary, Node, NodeStatus, NodeTelemetry, StreamingStrategy,
};
pub use planner::{
    rank_candidates, select_strategy, suitability_score, DistributionPlan, NodeCandidate,
    PlacementError, PlacementPlanner, PlacementRequest, PlanEstimates,
};
pub use registry::{NodeRegistry, RegistryError, RegistryResult};
pub use telemetry::{parse_telemetry, SshTelemetryProbe, TelemetryError, TelemetryProbe};
