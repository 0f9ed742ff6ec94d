use fieldsync_core::StoreError;
use uuid::Uuid;

/// Failures of the conflict queue's request/answer protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("conflict queue is closed")]
    QueueClosed,
    #[error("no conflict is pending")]
    NoPendingConflict,
    #[error("conflict for record {0} has no candidates")]
    NoCandidates(String),
    #[error("selected record {selected} is not a candidate of pending conflict {pending}")]
    SelectionMismatch { pending: String, selected: String },
    #[error("ticket {0} does not belong to the pending conflict")]
    StaleTicket(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("conflict resolver failed for record {record_id}: {message}")]
    Resolver { record_id: String, message: String },
    #[error("reconciliation cancelled")]
    Cancelled,
}
