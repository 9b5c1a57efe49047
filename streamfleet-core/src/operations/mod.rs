pub mod models;
pub mod queue;

pub use models::{backoff_delay_seconds, Operation, OperationKind, OperationStatus, QueueStatus};
pub use queue::{OperationError, OperationResult, StreamOperationQueue};
