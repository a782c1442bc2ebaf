use crate::error::ApiError;
use std::error::Error as StdError;
use thiserror::Error;
use uuid::Uuid;

/// Errors for the hot-side balance cache store
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BalanceStoreError {
    /// The cached balance could not be parsed as a number. The store deletes
    /// the affected key before surfacing this so the next read repopulates.
    #[error("corrupted balance data cached for account {0}")]
    Corrupt(Uuid),
    #[error("timed out waiting for the balance lock of account {0}")]
    LockTimeout(Uuid),
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
}

impl From<BalanceStoreError> for ApiError {
    fn from(src: BalanceStoreError) -> Self {
        ApiError::internal_server_error().detail(src.to_string())
    }
}

impl From<BalanceStoreError> for warp::Rejection {
    fn from(src: BalanceStoreError) -> Self {
        ApiError::from(src).into()
    }
}

#[cfg(feature = "redis_errors")]
impl From<redis::RedisError> for BalanceStoreError {
    fn from(src: redis::RedisError) -> BalanceStoreError {
        BalanceStoreError::Other(Box::new(src))
    }
}
