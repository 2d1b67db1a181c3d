/// Result enumeration for every ring operation.
///
/// All errors surface to the caller; nothing is retried internally. Reader
/// eviction is the only automatic recovery and is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Zero geometry, unknown reader id, or a commit larger than granted.
    #[error("invalid parameter")]
    InvalidParam,

    /// The segment header has not been initialized yet.
    #[error("ring not initialized")]
    NotInitialized,

    /// A writer borrow is already in flight, or a commit was attempted
    /// without an open borrow.
    #[error("operation not allowed")]
    NotAllowed,

    /// The reader table is full.
    #[error("too many readers")]
    TooManyReaders,

    /// The wait predicate was still false at the deadline.
    #[error("wait timed out")]
    Timeout,

    /// The underlying wait primitive failed.
    #[error("condition wait failed")]
    CondWaitFailed,
}

pub type RingResult<T> = Result<T, RingError>;
