use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::WorkerPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// Both launch strategies failed for a slot during initialisation.
    #[error("Failed to launch worker slot {index}: {reason:#}")]
    Launch { index: usize, reason: anyhow::Error },

    #[error("Worker pool has not been initialised")]
    NotInitialised,

    #[error("Worker pool has been destroyed")]
    Destroyed,

    #[error("No worker became free within {0:?}")]
    AcquireTimeout(Duration),

    #[error("Failed to open worker context: {0:#}")]
    Context(anyhow::Error),

    #[error("Task exceeded timeout of {0:?}")]
    TaskTimeout(Duration),

    /// The caller's task failed; the error is passed through untouched.
    #[error(transparent)]
    Task(anyhow::Error),
}

