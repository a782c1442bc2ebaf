use crate::{BalanceCacheStore, CreditError, LedgerStore, ReserveStatus};
use rust_decimal::Decimal;
use smsgate_errors::BalanceStoreError;
use smsgate_service::LedgerTransaction;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The credit ledger service.
///
/// `H` is the hot-store side (working balance, pending accumulator, locks)
/// and `D` the durable side (account rows, transaction log). Admission-path
/// calls (`get_balance`, `reserve`) only ever touch `H`; the durable store is
/// reached on cache repopulation, charges, refund records, and settlement.
#[derive(Clone)]
pub struct CreditService<H, D> {
    hot: H,
    durable: D,
}

impl<H, D> CreditService<H, D>
where
    H: BalanceCacheStore + Clone + Send + Sync + 'static,
    D: LedgerStore + Clone + Send + Sync + 'static,
{
    pub fn new(hot: H, durable: D) -> Self {
        CreditService { hot, durable }
    }

    /// Read-through working balance.
    ///
    /// A cache hit returns immediately. On a miss the caller acquires the
    /// per-account repopulation lock, double-checks the cache, loads the
    /// durable row, and seeds the cache - so a cold account does not send a
    /// thundering herd at the durable store.
    pub async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, CreditError> {
        if let Some(balance) = self.hot.get_cached_balance(account_id).await? {
            return Ok(balance);
        }

        let token = self
            .hot
            .acquire_balance_lock(account_id)
            .await?
            .ok_or(BalanceStoreError::LockTimeout(account_id))?;

        let result = self.populate_balance(account_id).await;
        // Always release, also when the durable load failed.
        if let Err(err) = self.hot.release_balance_lock(account_id, token).await {
            warn!(%account_id, "failed to release balance lock: {}", err);
        }
        result
    }

    async fn populate_balance(&self, account_id: Uuid) -> Result<Decimal, CreditError> {
        // Double-check: another holder may have populated while we waited.
        if let Some(balance) = self.hot.get_cached_balance(account_id).await? {
            return Ok(balance);
        }

        info!(%account_id, "balance cache miss, fetching from durable store inside lock");
        let balance = self.durable.load_balance(account_id).await?;
        self.hot.set_cached_balance(account_id, balance).await?;
        Ok(balance)
    }

    /// Reserves `amount` against the working balance.
    ///
    /// Executed as a single atomic script on the hot store. On a cache miss
    /// the balance is repopulated once and the script retried exactly once;
    /// a second miss or any non-ok outcome surfaces the failure.
    pub async fn reserve(&self, account_id: Uuid, amount: Decimal) -> Result<(), CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::NonPositiveAmount);
        }

        match self.hot.reserve(account_id, amount).await? {
            ReserveStatus::Ok => Ok(()),
            ReserveStatus::Insufficient => Err(CreditError::InsufficientBalance),
            ReserveStatus::Corrupt => {
                error!(%account_id, critical = true, "invalid balance data found in cache");
                Err(CreditError::CorruptBalance(account_id))
            }
            ReserveStatus::Miss => {
                warn!(%account_id, "balance key evaporated, retrying reservation");
                self.get_balance(account_id).await?;
                match self.hot.reserve(account_id, amount).await? {
                    ReserveStatus::Ok => Ok(()),
                    ReserveStatus::Insufficient => Err(CreditError::InsufficientBalance),
                    ReserveStatus::Corrupt => {
                        error!(%account_id, critical = true, "invalid balance data found in cache");
                        Err(CreditError::CorruptBalance(account_id))
                    }
                    ReserveStatus::Miss => Err(CreditError::ReservationFailed(account_id)),
                }
            }
        }
    }

    /// Adds prepaid credit to an account.
    ///
    /// The durable transaction row-locks the account, bumps balance and
    /// lifetime-charged and appends a `charge` ledger row; the cache is then
    /// advanced by the same amount (or seeded from the fresh balance if
    /// cold). Returns the new settled balance.
    pub async fn charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<Decimal, CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::NonPositiveAmount);
        }

        let new_balance = self.durable.charge(account_id, amount, description).await?;
        self.hot
            .apply_charge(account_id, amount, new_balance)
            .await?;
        info!(%account_id, %amount, "account charged");
        Ok(new_balance)
    }

    /// Refunds the reserved cost of a cancelled submission.
    ///
    /// The working balance gets the cost back and the pending accumulator is
    /// drained by the same amount, so the cancelled reservation never
    /// settles. A `refund` ledger row records the event against the
    /// submission id.
    pub async fn refund_cancellation(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<(), CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::NonPositiveAmount);
        }

        self.hot.refund_cancellation(account_id, amount).await?;
        self.durable
            .record_refund(account_id, amount, reference_id)
            .await?;
        debug!(%account_id, %amount, reference_id, "cancellation refunded");
        Ok(())
    }

    /// Folds one account's pending accumulator into the durable balance.
    ///
    /// Reads the pending value once, applies exactly that amount durably
    /// (row-locked, with one aggregate `deduct` ledger row), and then
    /// decrements pending by the observed value with an atomic float add -
    /// reservations racing the sweep land in the next one. Returns the
    /// settled amount, if any.
    pub async fn settle(&self, account_id: Uuid) -> Result<Option<Decimal>, CreditError> {
        let delta = self.hot.pending_amount(account_id).await?;
        if delta <= Decimal::ZERO {
            return Ok(None);
        }

        self.durable.apply_settlement(account_id, delta).await?;
        self.hot.decrement_pending(account_id, delta).await?;
        debug!(%account_id, %delta, "settled pending deductions");
        Ok(Some(delta))
    }

    /// Settlement sweep over every account that carries a pending
    /// accumulator. Per-account failures are logged and skipped so one bad
    /// account cannot stall the sweep. Returns the number of accounts
    /// settled.
    pub async fn settle_all(&self) -> Result<usize, CreditError> {
        let accounts = self.hot.pending_accounts().await?;
        let mut settled = 0;
        for account_id in accounts {
            match self.settle(account_id).await {
                Ok(Some(_)) => settled += 1,
                Ok(None) => {}
                Err(err) => {
                    error!(%account_id, "error settling account: {}", err);
                }
            }
        }
        if settled > 0 {
            info!(settled, "settlement sweep synced pending deductions");
        }
        Ok(settled)
    }

    pub async fn get_transactions(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, CreditError> {
        Ok(self.durable.get_transactions(account_id, limit).await?)
    }
}
