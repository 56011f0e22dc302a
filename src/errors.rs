use thiserror::Error;

/// Misuse of a [`TimeoutScheduler`](crate::TimeoutScheduler).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Timeout scheduler : already disposed")]
    Disposed,
    #[error(transparent)]
    TimeSource(#[from] TimeSourceError),
}

/// Failure while reading or driving a [`TimeSource`](crate::TimeSource).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeSourceError {
    #[error("Time source : released")]
    Released,
    #[error("Time source fault [{0}]")]
    Fault(String),
    #[error("Time source : unable to spawn timer thread [{0}]")]
    Spawn(String),
}

/// Failure reported by a [`SessionStore`](crate::SessionStore) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session store unavailable [{0}]")]
    Unavailable(String),
    #[error("Session store backend error [{0}]")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Malformed session token [{0}]")]
    MalformedToken(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Session lease coordinator : Build error  No session store set !")]
    BuildErrorNoStoreSet,
    #[error("Session lease coordinator : Build error  No scheduler set !")]
    BuildErrorNoSchedulerSet,
    #[error("Session lease coordinator : reconciliation already running")]
    ReconcileInProgress,
    #[error("Write-back pool error [{0}]")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
