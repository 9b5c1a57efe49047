pub mod manager;
pub mod models;
pub mod store;

pub use manager::{
    build_stream_command, job_marker, LifecycleError, LifecycleResult, StreamLifecycleManager,
};
pub use models::{
    CleanupSummary, JobStatus, MediaFile, SessionStatus, StartKind, StartReport, StopKind,
    StreamJob, StreamSession,
};
pub use store::LifecycleRepository;
