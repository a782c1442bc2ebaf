//! # smsgate-credits
//!
//! The two-tier credit ledger: a hot working balance in the cache store used
//! for admission decisions, and the settled truth in the durable store. The
//! [`CreditService`] coordinates the two - reservations are a single atomic
//! script against the hot side, settlement periodically folds the pending
//! accumulator into the durable balance, and charges/refunds keep both sides
//! aligned.
//!
//! The invariant the service maintains for every account `u` (whenever the
//! cache is warm and no settlement is in flight):
//!
//! ```text
//! durable_balance(u) - pending(u) == cached_balance(u)
//! ```

use async_trait::async_trait;
use rust_decimal::Decimal;
use smsgate_errors::{ApiError, BalanceStoreError, LedgerStoreError};
use smsgate_service::{Account, LedgerTransaction};
use thiserror::Error;
use uuid::Uuid;

mod service;
pub use service::CreditService;

/// Outcome of the atomic reservation script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveStatus {
    /// Balance was decremented and pending incremented.
    Ok,
    /// The working balance cannot cover the amount.
    Insufficient,
    /// The balance key is not populated; the caller repopulates and retries
    /// exactly once.
    Miss,
    /// The cached value did not parse as a number. The store has already
    /// deleted the key; the caller surfaces an internal error.
    Corrupt,
}

/// Account capabilities needed by the credit endpoints.
pub trait CreditAccount: Account {
    fn balance(&self) -> Decimal;
    fn total_charged(&self) -> Decimal;
    fn total_spent(&self) -> Decimal;
}

/// Hot-store side of the ledger: the working balance, the pending
/// accumulator, and the repopulation lock.
#[async_trait]
pub trait BalanceCacheStore {
    async fn get_cached_balance(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Decimal>, BalanceStoreError>;

    async fn set_cached_balance(
        &self,
        account_id: Uuid,
        balance: Decimal,
    ) -> Result<(), BalanceStoreError>;

    /// Atomically checks and decrements the working balance while
    /// incrementing the pending accumulator by the same amount. Two
    /// concurrent reservers must never both succeed when only one can be
    /// covered.
    async fn reserve(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<ReserveStatus, BalanceStoreError>;

    /// Applies a completed durable charge to the cache: increments the
    /// working balance if the key is populated, otherwise seeds it with the
    /// fresh durable balance.
    async fn apply_charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        fresh_balance: Decimal,
    ) -> Result<(), BalanceStoreError>;

    /// Returns a cancelled reservation: increments the working balance and
    /// drains the same amount out of pending (clamped at zero), so the
    /// cancelled cost never settles.
    async fn refund_cancellation(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError>;

    async fn pending_amount(&self, account_id: Uuid) -> Result<Decimal, BalanceStoreError>;

    /// Atomic float decrement of the pending accumulator, used by the
    /// settlement sweep so concurrent reservations during the sweep remain
    /// correct.
    async fn decrement_pending(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError>;

    /// Account ids that currently carry a pending accumulator.
    async fn pending_accounts(&self) -> Result<Vec<Uuid>, BalanceStoreError>;

    /// Acquires the per-account repopulation mutex, waiting up to the
    /// configured bound. Returns a release token, or `None` on timeout.
    async fn acquire_balance_lock(
        &self,
        account_id: Uuid,
    ) -> Result<Option<String>, BalanceStoreError>;

    async fn release_balance_lock(
        &self,
        account_id: Uuid,
        token: String,
    ) -> Result<(), BalanceStoreError>;
}

/// Durable side of the ledger: the account row and the append-only
/// transaction log.
#[async_trait]
pub trait LedgerStore {
    /// Loads the settled balance of an existing account.
    async fn load_balance(&self, account_id: Uuid) -> Result<Decimal, LedgerStoreError>;

    /// Within one transaction: row-locks the account, adds to balance and
    /// lifetime-charged, and appends a `charge` ledger row with the balance
    /// before/after. Returns the new settled balance.
    async fn charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<Decimal, LedgerStoreError>;

    /// Within one transaction: row-locks the account, subtracts the swept
    /// amount from the balance, adds it to lifetime-spent, and appends one
    /// aggregate `deduct` ledger row.
    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), LedgerStoreError>;

    /// Appends a `refund` ledger row for a cancellation. The settled balance
    /// is untouched - the reservation being refunded never settled.
    async fn record_refund(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<(), LedgerStoreError>;

    async fn get_transactions(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, LedgerStoreError>;
}

/// Errors surfaced by the credit service.
#[derive(Error, Debug)]
pub enum CreditError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("corrupted balance data for account {0}")]
    CorruptBalance(Uuid),
    #[error("reservation kept missing the balance cache for account {0}")]
    ReservationFailed(Uuid),
    #[error(transparent)]
    Balance(#[from] BalanceStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),
}

impl From<CreditError> for ApiError {
    fn from(src: CreditError) -> Self {
        match src {
            CreditError::InsufficientBalance => ApiError::insufficient_balance(),
            CreditError::NonPositiveAmount => ApiError::invalid_input("Amount must be positive"),
            CreditError::CorruptBalance(_) | CreditError::ReservationFailed(_) => {
                ApiError::internal_server_error()
            }
            CreditError::Balance(err) => err.into(),
            CreditError::Ledger(err) => err.into(),
        }
    }
}

