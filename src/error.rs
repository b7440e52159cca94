use thiserror::Error;

/// Error taxonomy for the cache synchronization core.
///
/// Expected runtime failures (`Network`, `Validation`, `Permission`,
/// `Conflict`) are returned as values and never panic. `ContractViolation`
/// indicates a breach of a core invariant (e.g. rolling back a patch twice)
/// and is the only class callers should treat as a bug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a failed remote operation may be retried by the scheduler.
    ///
    /// Only transient transport failures qualify. Conflicts trigger a
    /// rollback plus forced refetch instead of a blind retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Internal(format!("serialization: {err}"))
    }
}
