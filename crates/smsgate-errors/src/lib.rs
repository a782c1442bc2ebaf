/// [RFC7807](https://tools.ietf.org/html/rfc7807) compliant errors
mod error;
pub use error::*;

mod account_store_error;
pub use account_store_error::AccountStoreError;

mod balance_store_error;
pub use balance_store_error::BalanceStoreError;

mod ledger_store_error;
pub use ledger_store_error::LedgerStoreError;

mod message_store_error;
pub use message_store_error::MessageStoreError;

mod hot_store_errors;
pub use hot_store_errors::{
    BreakerStoreError, IdempotencyStoreError, LockStoreError, QueueStoreError,
    RateLimitStoreError, StatusStoreError,
};
