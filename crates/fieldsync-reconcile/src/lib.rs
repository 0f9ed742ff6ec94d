pub mod conflict;
pub mod error;
pub mod orchestrator;
pub mod resolver;

pub use conflict::{ConflictQueue, ConflictQueueHandle, ConflictState, PendingConflict};
pub use error::{ConflictError, ReconcileError};
pub use orchestrator::{DatasetOrchestrator, ReconcileInput, ReconcileSummary};
pub use resolver::{merge, ConflictResolver, MergeOutput};
