//! # smsgate-dispatch
//!
//! The delivery half of the gateway: priority dispatch queues drained by
//! worker pools, a per-downstream circuit breaker, and the provider adapter
//! capability. Workers never write submission rows - every terminal outcome
//! goes through the status buffer and is applied in bulk by the write-back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smsgate_errors::QueueStoreError;
use smsgate_service::{DispatchTask, Priority};

mod breaker;
mod provider;
mod worker;

pub use breaker::{CircuitBreaker, CircuitBreakerStore};
pub use provider::{ProviderError, SmsProvider, StubProvider};
pub use worker::{DispatchWorker, WorkerConfig, WorkerError};

/// A task handed out by [`DispatchQueueStore::reserve_task`].
///
/// Carries the raw serialized payload alongside the parsed task because the
/// late acknowledgment must remove the exact bytes that were moved onto the
/// in-flight list.
#[derive(Clone, Debug)]
pub struct ReservedTask {
    pub task: DispatchTask,
    pub raw: String,
}

/// Hot-store dispatch queues, one per priority, with late acknowledgment and
/// a delayed set for deferred retries.
#[async_trait]
pub trait DispatchQueueStore {
    /// Appends a task to its priority queue.
    async fn push_task(&self, task: &DispatchTask) -> Result<(), QueueStoreError>;

    /// Parks a task until `ready_at`; a promotion pass moves due tasks back
    /// onto their priority queues.
    async fn push_task_delayed(
        &self,
        task: &DispatchTask,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    /// Pops the next task of the given priority, moving it onto the
    /// in-flight list. The task stays there until [`ack_task`] so that a
    /// crashed worker does not lose it.
    ///
    /// [`ack_task`]: DispatchQueueStore::ack_task
    async fn reserve_task(
        &self,
        priority: Priority,
    ) -> Result<Option<ReservedTask>, QueueStoreError>;

    /// Late acknowledgment: removes a completed task from the in-flight
    /// list.
    async fn ack_task(&self, task: &ReservedTask) -> Result<(), QueueStoreError>;

    /// Moves delayed tasks whose ready time has passed back onto their
    /// priority queues. Returns how many were promoted.
    async fn promote_due_tasks(&self, now: DateTime<Utc>) -> Result<usize, QueueStoreError>;

    /// Returns tasks stranded on the in-flight lists (by a previous process
    /// death) to their queues. Returns how many were requeued.
    async fn requeue_inflight(&self, priority: Priority) -> Result<usize, QueueStoreError>;
}
