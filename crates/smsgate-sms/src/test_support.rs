//! In-memory stores shared by this crate's unit tests. They mirror the
//! semantics the Redis and Postgres backends provide, including the
//! atomicity of the reservation script and the terminal-status guards of
//! the bulk update.

use crate::{IdempotencyStore, IngestBufferStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smsgate_credits::{BalanceCacheStore, CreditService, LedgerStore, ReserveStatus};
use smsgate_dispatch::{DispatchQueueStore, ReservedTask};
use smsgate_errors::{
    BalanceStoreError, IdempotencyStoreError, LedgerStoreError, LockStoreError,
    MessageStoreError, QueueStoreError, StatusStoreError,
};
use smsgate_service::{
    Account, CancelOutcome, DispatchTask, JobLockStore, LedgerTransaction, MessageStatistics,
    MessageStore, NewSubmission, Priority, SmsMessage, SmsStatus, StatusBufferStore,
    StatusUpdate, TransactionKind,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct TestAccount {
    id: Uuid,
}

impl TestAccount {
    pub fn new() -> Self {
        TestAccount { id: Uuid::now_v7() }
    }
}

impl Account for TestAccount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &str {
        "tester"
    }

    fn rate_limit_per_minute(&self) -> u32 {
        100
    }
}

#[derive(Clone, Default)]
pub struct TestBalanceCache {
    inner: Arc<Mutex<BalanceState>>,
}

#[derive(Default)]
struct BalanceState {
    balances: HashMap<Uuid, Decimal>,
    pending: HashMap<Uuid, Decimal>,
}

impl TestBalanceCache {
    pub fn pending(&self, account_id: Uuid) -> Decimal {
        self.inner
            .lock()
            .pending
            .get(&account_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BalanceCacheStore for TestBalanceCache {
    async fn get_cached_balance(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Decimal>, BalanceStoreError> {
        Ok(self.inner.lock().balances.get(&account_id).copied())
    }

    async fn set_cached_balance(
        &self,
        account_id: Uuid,
        balance: Decimal,
    ) -> Result<(), BalanceStoreError> {
        self.inner.lock().balances.insert(account_id, balance);
        Ok(())
    }

    async fn reserve(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<ReserveStatus, BalanceStoreError> {
        let mut state = self.inner.lock();
        let balance = match state.balances.get(&account_id) {
            Some(balance) => *balance,
            None => return Ok(ReserveStatus::Miss),
        };
        if balance < amount {
            return Ok(ReserveStatus::Insufficient);
        }
        state.balances.insert(account_id, balance - amount);
        *state.pending.entry(account_id).or_default() += amount;
        Ok(ReserveStatus::Ok)
    }

    async fn apply_charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        fresh_balance: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut state = self.inner.lock();
        match state.balances.get(&account_id).copied() {
            Some(balance) => state.balances.insert(account_id, balance + amount),
            None => state.balances.insert(account_id, fresh_balance),
        };
        Ok(())
    }

    async fn refund_cancellation(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut state = self.inner.lock();
        let balance = state.balances.get(&account_id).copied().unwrap_or_default();
        state.balances.insert(account_id, balance + amount);
        let pending = state.pending.entry(account_id).or_default();
        *pending -= amount.min(*pending);
        Ok(())
    }

    async fn pending_amount(&self, account_id: Uuid) -> Result<Decimal, BalanceStoreError> {
        Ok(self.pending(account_id))
    }

    async fn decrement_pending(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut state = self.inner.lock();
        *state.pending.entry(account_id).or_default() -= amount;
        Ok(())
    }

    async fn pending_accounts(&self) -> Result<Vec<Uuid>, BalanceStoreError> {
        Ok(self.inner.lock().pending.keys().copied().collect())
    }

    async fn acquire_balance_lock(
        &self,
        _account_id: Uuid,
    ) -> Result<Option<String>, BalanceStoreError> {
        Ok(Some("token".to_owned()))
    }

    async fn release_balance_lock(
        &self,
        _account_id: Uuid,
        _token: String,
    ) -> Result<(), BalanceStoreError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct TestLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<Uuid, Decimal>,
    total_spent: HashMap<Uuid, Decimal>,
    transactions: Vec<LedgerTransaction>,
}

impl TestLedger {
    pub fn seed(&self, account_id: Uuid, balance: Decimal) {
        self.inner.lock().balances.insert(account_id, balance);
    }
}

#[async_trait]
impl LedgerStore for TestLedger {
    async fn load_balance(&self, account_id: Uuid) -> Result<Decimal, LedgerStoreError> {
        self.inner
            .lock()
            .balances
            .get(&account_id)
            .copied()
            .ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        _description: &str,
    ) -> Result<Decimal, LedgerStoreError> {
        let mut state = self.inner.lock();
        let after = state.balances.get(&account_id).copied().unwrap_or_default() + amount;
        state.balances.insert(account_id, after);
        Ok(after)
    }

    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), LedgerStoreError> {
        let mut state = self.inner.lock();
        let balance = state.balances.get(&account_id).copied().unwrap_or_default();
        state.balances.insert(account_id, balance - amount);
        *state.total_spent.entry(account_id).or_default() += amount;
        Ok(())
    }

    async fn record_refund(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<(), LedgerStoreError> {
        let mut state = self.inner.lock();
        let balance = state.balances.get(&account_id).copied().unwrap_or_default();
        let id = state.transactions.len() as i64 + 1;
        state.transactions.push(LedgerTransaction {
            id,
            account_id,
            kind: TransactionKind::Refund,
            amount,
            balance_before: balance,
            balance_after: balance,
            description: "cancellation refund".to_owned(),
            reference_id: Some(reference_id.to_owned()),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_transactions(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, LedgerStoreError> {
        Ok(self
            .inner
            .lock()
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.account_id == account_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

pub fn test_credits(
    account_id: Uuid,
    balance: Decimal,
) -> CreditService<TestBalanceCache, TestLedger> {
    let hot = TestBalanceCache::default();
    let durable = TestLedger::default();
    durable.seed(account_id, balance);
    hot.inner.lock().balances.insert(account_id, balance);
    CreditService::new(hot, durable)
}

/// One store standing in for the Redis side: idempotency markers, the two
/// staging buffers, and job locks.
#[derive(Clone, Default)]
pub struct TestHotBuffers {
    inner: Arc<Mutex<BufferState>>,
}

#[derive(Default)]
struct BufferState {
    markers: HashSet<String>,
    ingest: Vec<String>,
    status: Vec<String>,
    locks: HashSet<String>,
    push_failure: bool,
}

impl TestHotBuffers {
    pub fn buffered_submissions(&self) -> Vec<NewSubmission> {
        self.inner
            .lock()
            .ingest
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    pub fn push_raw_ingest(&self, raw: impl Into<String>) {
        self.inner.lock().ingest.push(raw.into());
    }

    pub fn push_raw_status(&self, raw: impl Into<String>) {
        self.inner.lock().status.push(raw.into());
    }

    pub fn ingest_len(&self) -> usize {
        self.inner.lock().ingest.len()
    }

    pub fn held_locks(&self) -> Vec<String> {
        self.inner.lock().locks.iter().cloned().collect()
    }

    pub fn fail_next_push(&self) {
        self.inner.lock().push_failure = true;
    }
}

#[async_trait]
impl IdempotencyStore for TestHotBuffers {
    async fn claim_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<bool, IdempotencyStoreError> {
        Ok(self
            .inner
            .lock()
            .markers
            .insert(format!("idempotency:{}:{}", account_id, request_id)))
    }

    async fn release_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<(), IdempotencyStoreError> {
        self.inner
            .lock()
            .markers
            .remove(&format!("idempotency:{}:{}", account_id, request_id));
        Ok(())
    }
}

#[async_trait]
impl IngestBufferStore for TestHotBuffers {
    async fn push_submission(
        &self,
        submission: &NewSubmission,
    ) -> Result<usize, StatusStoreError> {
        let mut state = self.inner.lock();
        if state.push_failure {
            state.push_failure = false;
            return Err(StatusStoreError::Other(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "buffer unavailable",
            ))));
        }
        state.ingest.push(serde_json::to_string(submission).unwrap());
        Ok(state.ingest.len())
    }

    async fn pop_submissions(&self, count: usize) -> Result<Vec<String>, StatusStoreError> {
        let mut state = self.inner.lock();
        let take = count.min(state.ingest.len());
        Ok(state.ingest.drain(..take).collect())
    }

    async fn requeue_submissions(&self, raw_items: &[String]) -> Result<(), StatusStoreError> {
        let mut state = self.inner.lock();
        for raw in raw_items.iter().rev() {
            state.ingest.insert(0, raw.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl StatusBufferStore for TestHotBuffers {
    async fn push_status_update(&self, update: &StatusUpdate) -> Result<(), StatusStoreError> {
        self.inner
            .lock()
            .status
            .push(serde_json::to_string(update).unwrap());
        Ok(())
    }

    async fn pop_status_updates(&self, count: usize) -> Result<Vec<String>, StatusStoreError> {
        let mut state = self.inner.lock();
        let take = count.min(state.status.len());
        Ok(state.status.drain(..take).collect())
    }
}

#[async_trait]
impl JobLockStore for TestHotBuffers {
    async fn acquire_job_lock(
        &self,
        name: &str,
        _ttl_seconds: u64,
    ) -> Result<bool, LockStoreError> {
        Ok(self.inner.lock().locks.insert(name.to_owned()))
    }

    async fn release_job_lock(&self, name: &str) -> Result<(), LockStoreError> {
        self.inner.lock().locks.remove(name);
        Ok(())
    }
}

/// In-memory messages table with the same guard semantics as the SQL
/// statements in the Postgres store.
#[derive(Clone, Default)]
pub struct TestMessages {
    inner: Arc<Mutex<HashMap<Uuid, SmsMessage>>>,
    fail_next_insert: Arc<Mutex<bool>>,
}

impl TestMessages {
    pub fn insert(&self, message: SmsMessage) {
        self.inner.lock().insert(message.id, message);
    }

    pub fn fail_next_insert(&self) {
        *self.fail_next_insert.lock() = true;
    }

    pub fn get(&self, id: Uuid) -> Option<SmsMessage> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn queued(account_id: Uuid) -> SmsMessage {
        SmsMessage {
            id: Uuid::now_v7(),
            account_id,
            recipient: "09123456789".to_owned(),
            message: "hello".to_owned(),
            status: SmsStatus::Queued,
            priority: Priority::Normal,
            cost: Decimal::from_str("0.10").unwrap(),
            scheduled_at: None,
            sent_at: None,
            failed_reason: String::new(),
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl MessageStore for TestMessages {
    async fn insert_submissions(
        &self,
        submissions: &[NewSubmission],
    ) -> Result<u64, MessageStoreError> {
        {
            let mut fail = self.fail_next_insert.lock();
            if *fail {
                *fail = false;
                return Err(MessageStoreError::Other(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "durable store unavailable",
                ))));
            }
        }
        let mut rows = self.inner.lock();
        let mut inserted = 0;
        for submission in submissions {
            if rows.contains_key(&submission.id) {
                continue;
            }
            rows.insert(
                submission.id,
                SmsMessage {
                    id: submission.id,
                    account_id: submission.account_id,
                    recipient: submission.recipient.clone(),
                    message: submission.message.clone(),
                    status: SmsStatus::Queued,
                    priority: submission.priority,
                    cost: submission.cost,
                    scheduled_at: submission.scheduled_at,
                    sent_at: None,
                    failed_reason: String::new(),
                    retry_count: 0,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn load_message(&self, id: Uuid) -> Result<Option<SmsMessage>, MessageStoreError> {
        Ok(self.inner.lock().get(&id).cloned())
    }

    async fn load_message_for_account(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SmsMessage>, MessageStoreError> {
        Ok(self
            .inner
            .lock()
            .get(&id)
            .filter(|m| m.account_id == account_id)
            .cloned())
    }

    async fn list_messages(
        &self,
        account_id: Uuid,
        status: Option<SmsStatus>,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<SmsMessage>, MessageStoreError> {
        let rows = self.inner.lock();
        let mut messages: Vec<SmsMessage> = rows
            .values()
            .filter(|m| m.account_id == account_id)
            .filter(|m| status.map(|s| m.status == s).unwrap_or(true))
            .filter(|m| before.map(|b| m.id < b).unwrap_or(true))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn apply_status_updates(
        &self,
        sent: &[Uuid],
        failed: &[(Uuid, String)],
    ) -> Result<u64, MessageStoreError> {
        let mut rows = self.inner.lock();
        let mut updated = 0;
        for id in sent {
            if let Some(row) = rows.get_mut(id) {
                if row.status != SmsStatus::Cancelled && row.status != SmsStatus::Sent {
                    row.status = SmsStatus::Sent;
                    row.sent_at = Some(Utc::now());
                    row.updated_at = Utc::now();
                    updated += 1;
                }
            }
        }
        for (id, reason) in failed {
            if let Some(row) = rows.get_mut(id) {
                if row.status != SmsStatus::Cancelled && row.status != SmsStatus::Sent {
                    row.status = SmsStatus::Failed;
                    row.failed_reason = reason.clone();
                    row.retry_count += 1;
                    row.updated_at = Utc::now();
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn cancel_message(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<CancelOutcome, MessageStoreError> {
        let mut rows = self.inner.lock();
        match rows.get_mut(&id).filter(|m| m.account_id == account_id) {
            Some(row) if row.status.is_cancellable() => {
                row.status = SmsStatus::Cancelled;
                row.updated_at = Utc::now();
                Ok(CancelOutcome::Cancelled { cost: row.cost })
            }
            Some(row) => Ok(CancelOutcome::NotCancellable { status: row.status }),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn statistics(&self, account_id: Uuid) -> Result<MessageStatistics, MessageStoreError> {
        let rows = self.inner.lock();
        let mine: Vec<&SmsMessage> = rows
            .values()
            .filter(|m| m.account_id == account_id)
            .collect();
        let total = mine.len() as i64;
        let sent = mine.iter().filter(|m| m.status == SmsStatus::Sent).count() as i64;
        let failed = mine.iter().filter(|m| m.status == SmsStatus::Failed).count() as i64;
        let pending = mine
            .iter()
            .filter(|m| matches!(m.status, SmsStatus::Pending | SmsStatus::Queued))
            .count() as i64;
        Ok(MessageStatistics::new(total, sent, failed, pending))
    }

    async fn claim_due_scheduled(
        &self,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        let now = Utc::now();
        let mut rows = self.inner.lock();
        let mut claimed = Vec::new();
        for row in rows.values_mut() {
            if claimed.len() as u32 >= limit {
                break;
            }
            if row.status == SmsStatus::Queued {
                if let Some(at) = row.scheduled_at {
                    if at <= now {
                        row.scheduled_at = None;
                        claimed.push((row.id, row.priority));
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn requeue_failed(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        let mut rows = self.inner.lock();
        let mut requeued = Vec::new();
        for row in rows.values_mut() {
            if requeued.len() as u32 >= limit {
                break;
            }
            if row.status == SmsStatus::Failed && row.retry_count < max_retries {
                row.status = SmsStatus::Queued;
                requeued.push((row.id, row.priority));
            }
        }
        Ok(requeued)
    }
}

#[derive(Clone, Default)]
pub struct TestQueues {
    inner: Arc<Mutex<TestQueueState>>,
}

#[derive(Default)]
pub struct TestQueueState {
    pub queued: Vec<DispatchTask>,
    pub delayed: Vec<(DispatchTask, chrono::DateTime<Utc>)>,
}

impl TestQueues {
    pub fn queued_tasks(&self) -> Vec<DispatchTask> {
        self.inner.lock().queued.clone()
    }
}

#[async_trait]
impl DispatchQueueStore for TestQueues {
    async fn push_task(&self, task: &DispatchTask) -> Result<(), QueueStoreError> {
        self.inner.lock().queued.push(task.clone());
        Ok(())
    }

    async fn push_task_delayed(
        &self,
        task: &DispatchTask,
        ready_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        self.inner.lock().delayed.push((task.clone(), ready_at));
        Ok(())
    }

    async fn reserve_task(
        &self,
        priority: Priority,
    ) -> Result<Option<ReservedTask>, QueueStoreError> {
        let mut state = self.inner.lock();
        let position = state.queued.iter().position(|t| t.priority == priority);
        Ok(position.map(|idx| {
            let task = state.queued.remove(idx);
            let raw = serde_json::to_string(&task).unwrap();
            ReservedTask { task, raw }
        }))
    }

    async fn ack_task(&self, _task: &ReservedTask) -> Result<(), QueueStoreError> {
        Ok(())
    }

    async fn promote_due_tasks(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<usize, QueueStoreError> {
        let mut state = self.inner.lock();
        let (due, later): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(_, at)| *at <= now);
        state.delayed = later;
        let count = due.len();
        for (task, _) in due {
            state.queued.push(task);
        }
        Ok(count)
    }

    async fn requeue_inflight(&self, _priority: Priority) -> Result<usize, QueueStoreError> {
        Ok(0)
    }
}
