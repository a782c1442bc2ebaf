use crate::error::ApiError;
use std::error::Error as StdError;
use thiserror::Error;

macro_rules! hot_store_error {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Error, Debug)]
        #[non_exhaustive]
        pub enum $name {
            #[error("{0}")]
            Other(#[from] Box<dyn StdError + Send + 'static>),
        }

        impl From<$name> for ApiError {
            fn from(src: $name) -> Self {
                ApiError::internal_server_error().detail(src.to_string())
            }
        }

        impl From<$name> for warp::Rejection {
            fn from(src: $name) -> Self {
                ApiError::from(src).into()
            }
        }

        #[cfg(feature = "redis_errors")]
        impl From<redis::RedisError> for $name {
            fn from(src: redis::RedisError) -> $name {
                $name::Other(Box::new(src))
            }
        }
    };
}

hot_store_error!(
    /// Errors for the idempotency marker store
    IdempotencyStoreError
);

hot_store_error!(
    /// Errors for the ingest / status staging buffers
    StatusStoreError
);

hot_store_error!(
    /// Errors for the dispatch queue store
    QueueStoreError
);

hot_store_error!(
    /// Errors for the circuit breaker state store
    BreakerStoreError
);

hot_store_error!(
    /// Errors for the advisory job lock store
    LockStoreError
);

hot_store_error!(
    /// Errors for the sliding-window rate limit store
    RateLimitStoreError
);
