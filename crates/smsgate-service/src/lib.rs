//! # smsgate-service
//!
//! Core abstractions shared across the SMS gateway implementation.
//!
//! Every other crate builds on the types and store traits defined here: the
//! admission path and the HTTP API see tenants through the [`Account`] trait,
//! submissions travel through the system as [`SmsMessage`] rows and
//! [`StatusUpdate`] / [`DispatchTask`] payloads, and the backends (Redis for
//! the hot path, Postgres for settled truth) implement the store traits so
//! that the services stay backend-agnostic and unit-testable with in-memory
//! stores.

use async_trait::async_trait;
use secrecy::SecretString;
use smsgate_errors::{
    AccountStoreError, LockStoreError, MessageStoreError, RateLimitStoreError, StatusStoreError,
};
use std::fmt::Debug;
use uuid::Uuid;

mod types;
pub use types::{
    new_submission_id, submission_created_at, CancelOutcome, DispatchTask, LedgerTransaction,
    MessageStatistics, NewSubmission, Priority, SmsMessage, SmsStatus, StatusUpdate,
    TransactionKind,
};

pub use rust_decimal::Decimal;

/// The base trait that tenant account types extend.
///
/// Store implementations provide a concrete type loaded from the database;
/// services only ever need the id and the per-minute request allowance.
pub trait Account: Clone + Send + Sized + Debug {
    fn id(&self) -> Uuid;
    fn username(&self) -> &str;
    fn rate_limit_per_minute(&self) -> u32;
}

/// Hex SHA-256 fingerprint of a raw API key. The raw key exists only in the
/// provisioning response and the tenant's `X-Api-Key` header; everything
/// else handles the fingerprint.
pub fn api_key_fingerprint(raw_key: &str) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, raw_key.as_bytes()))
}

/// Durable store of tenant accounts.
///
/// Provisioning is an explicit call made when a tenant is created; it returns
/// the raw API key exactly once and only the SHA-256 fingerprint is kept.
#[async_trait]
pub trait AccountStore {
    type Account: Account;

    async fn get_account(&self, account_id: Uuid) -> Result<Self::Account, AccountStoreError>;

    /// Looks an account up by the hex SHA-256 fingerprint of its API key.
    async fn get_account_by_api_key(
        &self,
        api_key_hash: &str,
    ) -> Result<Self::Account, AccountStoreError>;

    async fn insert_account(
        &self,
        username: &str,
        rate_limit_per_minute: u32,
    ) -> Result<(Self::Account, SecretString), AccountStoreError>;
}

/// Durable store of submissions.
///
/// Backed by the range-partitioned `sms_messages` table. All status mutation
/// other than cancellation goes through [`apply_status_updates`], which
/// enforces the terminal-status rules (a buffered update never overrides
/// `cancelled`, and `sent` is never regressed).
///
/// [`apply_status_updates`]: MessageStore::apply_status_updates
#[async_trait]
pub trait MessageStore {
    /// Bulk insert with conflict-ignore on the primary key. Returns the
    /// number of rows actually inserted.
    async fn insert_submissions(
        &self,
        submissions: &[NewSubmission],
    ) -> Result<u64, MessageStoreError>;

    async fn load_message(&self, id: Uuid) -> Result<Option<SmsMessage>, MessageStoreError>;

    async fn load_message_for_account(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SmsMessage>, MessageStoreError>;

    /// Lists a tenant's messages in descending id order (ids are
    /// time-ordered, so this is newest-first). `before` is a keyset cursor.
    async fn list_messages(
        &self,
        account_id: Uuid,
        status: Option<SmsStatus>,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<SmsMessage>, MessageStoreError>;

    /// Applies a drained write-back batch: `sent` ids get `status = sent` and
    /// a send timestamp, `failed` ids get the failure reason and a retry
    /// count bump. Updates that conflict with a terminal status are dropped.
    /// Returns the number of rows updated.
    async fn apply_status_updates(
        &self,
        sent: &[Uuid],
        failed: &[(Uuid, String)],
    ) -> Result<u64, MessageStoreError>;

    /// Atomically flips a cancellable submission to `cancelled`. The status
    /// check and the flip are a single conditional update so that two
    /// concurrent cancels cannot both observe a refundable row.
    async fn cancel_message(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<CancelOutcome, MessageStoreError>;

    async fn statistics(&self, account_id: Uuid) -> Result<MessageStatistics, MessageStoreError>;

    /// Claims queued submissions whose scheduled time has arrived, clearing
    /// the schedule mark in the same statement so a claim is handed out once.
    async fn claim_due_scheduled(
        &self,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError>;

    /// Flips `failed` submissions with retry budget back to `queued` and
    /// returns them for re-dispatch.
    async fn requeue_failed(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError>;
}

/// Hot-store staging list for terminal status updates emitted by workers.
///
/// Workers never write submission rows directly; everything funnels through
/// this buffer and the periodic write-back drains it in bulk.
#[async_trait]
pub trait StatusBufferStore {
    async fn push_status_update(&self, update: &StatusUpdate) -> Result<(), StatusStoreError>;

    /// Pops up to `count` raw items in one call. Items are returned
    /// unparsed so the write-back can log-and-skip poison entries.
    async fn pop_status_updates(&self, count: usize) -> Result<Vec<String>, StatusStoreError>;
}

/// Named advisory locks guarding the periodic jobs, so a tick proceeds on at
/// most one instance.
#[async_trait]
pub trait JobLockStore {
    /// Returns `true` iff the lock was acquired. The lock expires on its own
    /// after `ttl_seconds`; release early when the tick finishes cleanly.
    async fn acquire_job_lock(&self, name: &str, ttl_seconds: u64) -> Result<bool, LockStoreError>;

    async fn release_job_lock(&self, name: &str) -> Result<(), LockStoreError>;
}

/// Sliding-window request counter keyed by tenant.
#[async_trait]
pub trait RateLimitStore {
    /// Records a hit on the account's one-minute window and reports whether
    /// the account is over its limit. An over-limit hit is not counted
    /// against the window.
    async fn is_rate_limited(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<bool, RateLimitStoreError>;
}

/// Liveness probe of a backend, for the health endpoint.
#[async_trait]
pub trait HealthCheckStore {
    async fn is_healthy(&self) -> bool;
}

/// Durable-store partition maintenance for the messages table.
#[async_trait]
pub trait PartitionStore {
    /// Creates the yearly partition for `year` (with its `created_at` index)
    /// if it does not already exist. Returns the partition name when one was
    /// created.
    async fn ensure_year_partition(&self, year: i32) -> Result<Option<String>, MessageStoreError>;
}
