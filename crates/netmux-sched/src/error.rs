use crate::worker::WorkerStatus;

/// Errors that can occur in scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The requested worker status transition is not legal.
    #[error("illegal worker transition {from:?} -> {to:?}")]
    InvalidState {
        from: WorkerStatus,
        to: WorkerStatus,
    },

    /// No group with that name is registered with the boss.
    #[error("unknown worker group '{0}'")]
    UnknownGroup(String),

    /// The boss's workers are not all in the same status.
    #[error("workers out of sync")]
    OutOfSync,

    /// The OS refused to spawn the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedError>;
