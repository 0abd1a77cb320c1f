//! Error types for the store layer.

/// Errors surfaced by a coordination store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key holds a value of a different shape (e.g. LPUSH on a
    /// plain string). Always a programming error, never transient.
    #[error("wrong value type for key {0}")]
    WrongType(String),

    /// The backend could not be reached or answered with a failure.
    /// The in-memory store never produces this; networked backends do.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the distributed lock manager.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not acquired within the retry budget. The guarded
    /// operation was not started; callers may retry later.
    #[error("failed to acquire lock {key} after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },

    /// The underlying store failed mid-operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}
