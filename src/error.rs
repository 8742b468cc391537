use thiserror::Error;

/// Errors surfaced by the collaborator stores (tenant directory, model
/// catalog, usage sink, counter store).
///
/// Callers decide fail-open vs. fail-closed; admission fails closed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("drain deadline exceeded with {remaining} bookkeeping tasks in flight")]
    DeadlineExceeded { remaining: usize },
}
