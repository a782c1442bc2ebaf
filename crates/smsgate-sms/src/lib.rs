//! # smsgate-sms
//!
//! The submission half of the gateway: the synchronous admission path
//! (idempotency gate, validation, cost reservation, buffered enqueue), the
//! periodic ingest batcher that folds the buffer into the durable store, the
//! status write-back that applies worker outcomes in bulk, and the
//! scheduled-send / retry sweeps.
//!
//! The acceptor never touches the durable store - admission must not block
//! on a slow primary. Everything durable happens on the periodic jobs.

use async_trait::async_trait;
use smsgate_errors::{
    ApiError, IdempotencyStoreError, LockStoreError, MessageStoreError, QueueStoreError,
    StatusStoreError,
};
use smsgate_service::NewSubmission;
use thiserror::Error;
use uuid::Uuid;

mod acceptor;
mod ingest;
mod service;
mod sweeps;
#[cfg(test)]
pub(crate) mod test_support;
mod writeback;

pub use acceptor::{Accepted, AcceptorConfig, SmsAcceptor, SubmitRequest};
pub use ingest::{IngestBatcher, IngestConfig, INGEST_LOCK_NAME};
pub use service::{CancelError, SmsService};
pub use sweeps::{RetrySweep, ScheduledSendGate, RETRY_LOCK_NAME, SCHEDULED_LOCK_NAME};
pub use writeback::{StatusWriteback, WritebackConfig, WRITEBACK_LOCK_NAME};

/// Per-(tenant, request id) idempotency markers with a 24 hour TTL.
#[async_trait]
pub trait IdempotencyStore {
    /// Atomically claims the marker. Returns `true` iff it was absent;
    /// a `false` means the request id was already used within the window.
    async fn claim_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<bool, IdempotencyStoreError>;

    /// Removes the marker so a failed admission can be retried.
    async fn release_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<(), IdempotencyStoreError>;
}

/// Hot-store staging list between the acceptor and the ingest batcher.
#[async_trait]
pub trait IngestBufferStore {
    /// Appends a submission and returns the new buffer length, which the
    /// acceptor uses as a high-water-mark signal.
    async fn push_submission(&self, submission: &NewSubmission)
        -> Result<usize, StatusStoreError>;

    /// Pops up to `count` raw items in one call.
    async fn pop_submissions(&self, count: usize) -> Result<Vec<String>, StatusStoreError>;

    /// Returns raw items to the head of the buffer after a failed bulk
    /// insert. Ordering within the batch is not contractual.
    async fn requeue_submissions(&self, raw_items: &[String]) -> Result<(), StatusStoreError>;
}

/// Failure surfaced by the admission path.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("duplicate request")]
    DuplicateRequest,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error(transparent)]
    Credit(smsgate_credits::CreditError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyStoreError),
    #[error(transparent)]
    Buffer(#[from] StatusStoreError),
}

impl From<SubmitError> for ApiError {
    fn from(src: SubmitError) -> Self {
        match src {
            SubmitError::InvalidInput(detail) => ApiError::invalid_input(detail),
            SubmitError::DuplicateRequest => ApiError::duplicate_request(),
            SubmitError::InsufficientBalance => ApiError::insufficient_balance(),
            SubmitError::Credit(err) => err.into(),
            SubmitError::Idempotency(err) => err.into(),
            SubmitError::Buffer(err) => err.into(),
        }
    }
}

/// Failure inside a periodic job tick. The tick is aborted, the advisory
/// lock released, and the next tick retries.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Lock(#[from] LockStoreError),
    #[error(transparent)]
    Message(#[from] MessageStoreError),
    #[error(transparent)]
    Queue(#[from] QueueStoreError),
    #[error(transparent)]
    Buffer(#[from] StatusStoreError),
}
