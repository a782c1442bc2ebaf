use super::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use smsgate_credits::ReserveStatus;
use smsgate_errors::{
    AccountStoreError, BalanceStoreError, IdempotencyStoreError, LedgerStoreError,
    MessageStoreError, RateLimitStoreError, StatusStoreError,
};
use smsgate_service::{
    CancelOutcome, MessageStatistics, NewSubmission, Priority, TransactionKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// In-memory stores standing in for Redis and Postgres.
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TestHotStore {
    inner: Arc<Mutex<HotState>>,
    healthy: Arc<Mutex<bool>>,
}

#[derive(Default)]
struct HotState {
    balances: HashMap<Uuid, Decimal>,
    pending: HashMap<Uuid, Decimal>,
    markers: HashSet<String>,
    ingest: Vec<String>,
    hits: HashMap<Uuid, u32>,
}

impl TestHotStore {
    fn new() -> Self {
        let store = TestHotStore::default();
        *store.healthy.lock() = true;
        store
    }

    fn ingest_len(&self) -> usize {
        self.inner.lock().ingest.len()
    }

    fn balance(&self, account_id: Uuid) -> Decimal {
        self.inner
            .lock()
            .balances
            .get(&account_id)
            .copied()
            .unwrap_or_default()
    }

    fn set_unhealthy(&self) {
        *self.healthy.lock() = false;
    }
}

#[async_trait]
impl BalanceCacheStore for TestHotStore {
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
        Ok(self
            .inner
            .lock()
            .pending
            .get(&account_id)
            .copied()
            .unwrap_or_default())
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

#[async_trait]
impl IdempotencyStore for TestHotStore {
    async fn claim_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<bool, IdempotencyStoreError> {
        Ok(self
            .inner
            .lock()
            .markers
            .insert(format!("{}:{}", account_id, request_id)))
    }

    async fn release_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<(), IdempotencyStoreError> {
        self.inner
            .lock()
            .markers
            .remove(&format!("{}:{}", account_id, request_id));
        Ok(())
    }
}

#[async_trait]
impl IngestBufferStore for TestHotStore {
    async fn push_submission(
        &self,
        submission: &NewSubmission,
    ) -> Result<usize, StatusStoreError> {
        let mut state = self.inner.lock();
        state
            .ingest
            .push(serde_json::to_string(submission).unwrap());
        Ok(state.ingest.len())
    }

    async fn pop_submissions(&self, count: usize) -> Result<Vec<String>, StatusStoreError> {
        let mut state = self.inner.lock();
        let take = count.min(state.ingest.len());
        Ok(state.ingest.drain(..take).collect())
    }

    async fn requeue_submissions(&self, _raw_items: &[String]) -> Result<(), StatusStoreError> {
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for TestHotStore {
    async fn is_rate_limited(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<bool, RateLimitStoreError> {
        let mut state = self.inner.lock();
        let hits = state.hits.entry(account_id).or_insert(0);
        if *hits >= limit {
            return Ok(true);
        }
        *hits += 1;
        Ok(false)
    }
}

#[async_trait]
impl HealthCheckStore for TestHotStore {
    async fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }
}

#[derive(Clone, Debug, Serialize)]
struct TestAccount {
    id: Uuid,
    username: String,
    balance: Decimal,
    total_charged: Decimal,
    total_spent: Decimal,
    rate_limit_per_minute: u32,
}

impl Account for TestAccount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn rate_limit_per_minute(&self) -> u32 {
        self.rate_limit_per_minute
    }
}

impl CreditAccount for TestAccount {
    fn balance(&self) -> Decimal {
        self.balance
    }

    fn total_charged(&self) -> Decimal {
        self.total_charged
    }

    fn total_spent(&self) -> Decimal {
        self.total_spent
    }
}

#[derive(Clone, Default)]
struct TestDurableStore {
    accounts: Arc<Mutex<HashMap<String, TestAccount>>>,
    messages: Arc<Mutex<HashMap<Uuid, SmsMessage>>>,
    transactions: Arc<Mutex<Vec<LedgerTransaction>>>,
    healthy: Arc<Mutex<bool>>,
}

impl TestDurableStore {
    fn new() -> Self {
        let store = TestDurableStore::default();
        *store.healthy.lock() = true;
        store
    }

    fn add_account(&self, raw_key: &str, balance: Decimal, rate_limit: u32) -> TestAccount {
        let account = TestAccount {
            id: Uuid::now_v7(),
            username: format!("tenant-{}", raw_key),
            balance,
            total_charged: balance,
            total_spent: Decimal::ZERO,
            rate_limit_per_minute: rate_limit,
        };
        self.accounts
            .lock()
            .insert(api_key_fingerprint(raw_key), account.clone());
        account
    }

    fn insert_message(&self, message: SmsMessage) {
        self.messages.lock().insert(message.id, message);
    }

    fn message(&self, id: Uuid) -> Option<SmsMessage> {
        self.messages.lock().get(&id).cloned()
    }
}

#[async_trait]
impl AccountStore for TestDurableStore {
    type Account = TestAccount;

    async fn get_account(&self, account_id: Uuid) -> Result<TestAccount, AccountStoreError> {
        self.accounts
            .lock()
            .values()
            .find(|a| a.id == account_id)
            .cloned()
            .ok_or_else(|| AccountStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn get_account_by_api_key(
        &self,
        api_key_hash: &str,
    ) -> Result<TestAccount, AccountStoreError> {
        self.accounts
            .lock()
            .get(api_key_hash)
            .cloned()
            .ok_or_else(|| AccountStoreError::AccountNotFound("api key".to_owned()))
    }

    async fn insert_account(
        &self,
        username: &str,
        rate_limit_per_minute: u32,
    ) -> Result<(TestAccount, SecretString), AccountStoreError> {
        let raw_key = format!("key-{}", username);
        let account = self.add_account(&raw_key, Decimal::ZERO, rate_limit_per_minute);
        Ok((account, SecretString::new(raw_key)))
    }
}

#[async_trait]
impl LedgerStore for TestDurableStore {
    async fn load_balance(&self, account_id: Uuid) -> Result<Decimal, LedgerStoreError> {
        self.accounts
            .lock()
            .values()
            .find(|a| a.id == account_id)
            .map(|a| a.balance)
            .ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<Decimal, LedgerStoreError> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .values_mut()
            .find(|a| a.id == account_id)
            .ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))?;
        let before = account.balance;
        account.balance += amount;
        account.total_charged += amount;
        let mut transactions = self.transactions.lock();
        let id = transactions.len() as i64 + 1;
        transactions.push(LedgerTransaction {
            id,
            account_id,
            kind: TransactionKind::Charge,
            amount,
            balance_before: before,
            balance_after: account.balance,
            description: description.to_owned(),
            reference_id: None,
            created_at: Utc::now(),
        });
        Ok(account.balance)
    }

    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), LedgerStoreError> {
        let mut accounts = self.accounts.lock();
        if let Some(account) = accounts.values_mut().find(|a| a.id == account_id) {
            account.balance -= amount;
            account.total_spent += amount;
        }
        Ok(())
    }

    async fn record_refund(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<(), LedgerStoreError> {
        let mut transactions = self.transactions.lock();
        let id = transactions.len() as i64 + 1;
        transactions.push(LedgerTransaction {
            id,
            account_id,
            kind: TransactionKind::Refund,
            amount,
            balance_before: Decimal::ZERO,
            balance_after: Decimal::ZERO,
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
            .transactions
            .lock()
            .iter()
            .rev()
            .filter(|tx| tx.account_id == account_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageStore for TestDurableStore {
    async fn insert_submissions(
        &self,
        submissions: &[NewSubmission],
    ) -> Result<u64, MessageStoreError> {
        let mut rows = self.messages.lock();
        let mut inserted = 0;
        for submission in submissions {
            if !rows.contains_key(&submission.id) {
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
        }
        Ok(inserted)
    }

    async fn load_message(&self, id: Uuid) -> Result<Option<SmsMessage>, MessageStoreError> {
        Ok(self.messages.lock().get(&id).cloned())
    }

    async fn load_message_for_account(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SmsMessage>, MessageStoreError> {
        Ok(self
            .messages
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
        let rows = self.messages.lock();
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
        _sent: &[Uuid],
        _failed: &[(Uuid, String)],
    ) -> Result<u64, MessageStoreError> {
        Ok(0)
    }

    async fn cancel_message(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<CancelOutcome, MessageStoreError> {
        let mut rows = self.messages.lock();
        match rows.get_mut(&id).filter(|m| m.account_id == account_id) {
            Some(row) if row.status.is_cancellable() => {
                row.status = SmsStatus::Cancelled;
                Ok(CancelOutcome::Cancelled { cost: row.cost })
            }
            Some(row) => Ok(CancelOutcome::NotCancellable { status: row.status }),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn statistics(&self, account_id: Uuid) -> Result<MessageStatistics, MessageStoreError> {
        let rows = self.messages.lock();
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
        _limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        Ok(Vec::new())
    }

    async fn requeue_failed(
        &self,
        _max_retries: i32,
        _limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl HealthCheckStore for TestDurableStore {
    async fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

static API_KEY: &str = "raw-test-api-key";

struct Harness {
    hot: TestHotStore,
    durable: TestDurableStore,
    account: TestAccount,
    filter: BoxedFilter<(Box<dyn Reply>,)>,
}

fn harness_with(balance: Decimal, rate_limit: u32) -> Harness {
    let hot = TestHotStore::new();
    let durable = TestDurableStore::new();
    let account = durable.add_account(API_KEY, balance, rate_limit);
    hot.inner.lock().balances.insert(account.id, balance);

    let api = SmsGatewayApi::new(
        hot.clone(),
        durable.clone(),
        AcceptorConfig {
            base_cost: dec!(10),
            express_multiplier: dec!(2.0),
            ingest_high_water: 5000,
        },
        Arc::new(Notify::new()),
    );
    let filter = api_filter(api).map(|reply| Box::new(reply) as Box<dyn Reply>).boxed();
    Harness {
        hot,
        durable,
        account,
        filter,
    }
}

fn harness() -> Harness {
    harness_with(dec!(100), 100)
}

fn send_request(body: serde_json::Value) -> warp::test::RequestBuilder {
    warp::test::request()
        .method("POST")
        .path("/api/sms/send")
        .header("x-api-key", API_KEY)
        .json(&body)
}

fn valid_send_body() -> serde_json::Value {
    serde_json::json!({ "recipient": "09123456789", "message": "hello" })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_accepts_and_reserves_the_cost() {
    let h = harness();
    let response = send_request(valid_send_body()).reply(&h.filter).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["cost"], "10");
    assert!(body["sms_id"].is_string());

    assert_eq!(h.hot.balance(h.account.id), dec!(90));
    assert_eq!(h.hot.ingest_len(), 1);
}

#[tokio::test]
async fn duplicate_request_id_gets_conflict_and_charges_once() {
    let h = harness();
    let first = send_request(valid_send_body())
        .header("x-request-id", "R")
        .reply(&h.filter)
        .await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = send_request(valid_send_body())
        .header("x-request-id", "R")
        .reply(&h.filter)
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    assert_eq!(h.hot.balance(h.account.id), dec!(90));
    assert_eq!(h.hot.ingest_len(), 1);
}

#[tokio::test]
async fn insufficient_balance_rejects_without_buffering() {
    let h = harness_with(dec!(5), 100);
    let response = send_request(valid_send_body())
        .header("x-request-id", "R")
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert!(body["type"]
        .as_str()
        .unwrap()
        .ends_with("credits/insufficient-balance"));

    assert_eq!(h.hot.balance(h.account.id), dec!(5));
    assert_eq!(h.hot.ingest_len(), 0);

    // the idempotency marker was released, the id is retryable
    let retry = send_request(valid_send_body())
        .header("x-request-id", "R")
        .reply(&h.filter)
        .await;
    assert_eq!(retry.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_recipient_is_bad_request() {
    let h = harness();
    let response = send_request(serde_json::json!({
        "recipient": "12345",
        "message": "hello"
    }))
    .reply(&h.filter)
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.hot.balance(h.account.id), dec!(100));
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let h = harness();
    let response = warp::test::request()
        .method("POST")
        .path("/api/sms/send")
        .json(&valid_send_body())
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_api_key_is_unauthorized() {
    let h = harness();
    let response = warp::test::request()
        .method("GET")
        .path("/api/sms/statistics")
        .header("x-api-key", "wrong-key")
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn requests_over_the_window_are_rate_limited() {
    let h = harness_with(dec!(100), 2);
    for _ in 0..2 {
        let ok = warp::test::request()
            .method("GET")
            .path("/api/sms/statistics")
            .header("x-api-key", API_KEY)
            .reply(&h.filter)
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
    }
    let limited = warp::test::request()
        .method("GET")
        .path("/api/sms/statistics")
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn cancel_flips_status_and_refunds() {
    let h = harness();
    let mut row = SmsMessage {
        id: Uuid::now_v7(),
        account_id: h.account.id,
        recipient: "09123456789".to_owned(),
        message: "hello".to_owned(),
        status: SmsStatus::Queued,
        priority: Priority::Normal,
        cost: dec!(10),
        scheduled_at: None,
        sent_at: None,
        failed_reason: String::new(),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    row.cost = dec!(10);
    h.durable.insert_message(row.clone());

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/sms/messages/{}/cancel", row.id))
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "cancelled");

    assert_eq!(
        h.durable.message(row.id).unwrap().status,
        SmsStatus::Cancelled
    );
    assert_eq!(h.hot.balance(h.account.id), dec!(110));

    // cancelling again conflicts
    let again = warp::test::request()
        .method("POST")
        .path(&format!("/api/sms/messages/{}/cancel", row.id))
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.hot.balance(h.account.id), dec!(110));
}

#[tokio::test]
async fn detail_of_unknown_message_is_not_found() {
    let h = harness();
    let response = warp::test::request()
        .method("GET")
        .path(&format!("/api/sms/messages/{}", Uuid::now_v7()))
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_by_status_and_paginates() {
    let h = harness();
    for _ in 0..3 {
        let response = send_request(valid_send_body()).reply(&h.filter).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
    // drain the buffer into the durable mock
    let raw = h.hot.pop_submissions(100).await.unwrap();
    let submissions: Vec<NewSubmission> = raw
        .iter()
        .map(|item| serde_json::from_str(item).unwrap())
        .collect();
    h.durable.insert_submissions(&submissions).await.unwrap();

    let response = warp::test::request()
        .method("GET")
        .path("/api/sms/messages?status=queued&limit=2")
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    let next = body["next"].as_str().unwrap();
    assert!(next.contains("before="));
    assert!(next.contains("status=queued"));

    let unknown = warp::test::request()
        .method("GET")
        .path("/api/sms/messages?status=bogus")
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn balance_endpoint_reports_working_balance_and_totals() {
    let h = harness();
    let response = warp::test::request()
        .method("GET")
        .path("/api/credits/balance")
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["balance"], "100");
    assert_eq!(body["total_charged"], "100");
    assert_eq!(body["total_spent"], "0");
}

#[tokio::test]
async fn charge_adds_credit_and_rejects_non_positive_amounts() {
    let h = harness();
    let response = warp::test::request()
        .method("POST")
        .path("/api/credits/charge")
        .header("x-api-key", API_KEY)
        .json(&serde_json::json!({ "amount": 50, "description": "top up" }))
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["balance"], "150");
    assert_eq!(h.hot.balance(h.account.id), dec!(150));

    let rejected = warp::test::request()
        .method("POST")
        .path("/api/credits/charge")
        .header("x-api-key", API_KEY)
        .json(&serde_json::json!({ "amount": 0 }))
        .reply(&h.filter)
        .await;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn transactions_lists_the_ledger() {
    let h = harness();
    warp::test::request()
        .method("POST")
        .path("/api/credits/charge")
        .header("x-api-key", API_KEY)
        .json(&serde_json::json!({ "amount": 25 }))
        .reply(&h.filter)
        .await;

    let response = warp::test::request()
        .method("GET")
        .path("/api/credits/transactions?limit=10")
        .header("x-api-key", API_KEY)
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["kind"], "charge");
}

#[tokio::test]
async fn health_reflects_component_status() {
    let h = harness();
    let response = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&h.filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    h.hot.set_unhealthy();
    let degraded = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&h.filter)
        .await;
    assert_eq!(degraded.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(degraded.body()).unwrap();
    assert_eq!(body["components"]["hot_store"], "down");
    assert_eq!(body["components"]["durable_store"], "up");
}
