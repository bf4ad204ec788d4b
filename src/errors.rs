use thiserror::Error;

/// Failures originating in the backing key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store deadline exceeded")]
    DeadlineExceeded,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A transient race: a CAS lost, a slot was taken, or a precondition
    /// went stale. Handled by bounded internal retry, never surfaced as a
    /// terminal failure unless the retry budget runs out.
    #[error("conflicting concurrent update")]
    Conflict,
    /// No work is currently available (e.g. no compaction candidate).
    /// A signal to stop a background pass, not a user-facing error.
    #[error("no eligible work")]
    Exhausted,
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MetaError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::Conflict
                | MetaError::Store(StoreError::DeadlineExceeded)
                | MetaError::Store(StoreError::Unavailable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MetaError::Conflict.is_retryable());
        assert!(MetaError::Store(StoreError::DeadlineExceeded).is_retryable());
        assert!(!MetaError::NotFound.is_retryable());
        assert!(!MetaError::PermissionDenied.is_retryable());
        assert!(!MetaError::Store(StoreError::Corrupt("x".into())).is_retryable());
    }
}
