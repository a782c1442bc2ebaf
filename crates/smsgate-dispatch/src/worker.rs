use crate::{
    CircuitBreaker, CircuitBreakerStore, DispatchQueueStore, ProviderError, ReservedTask,
    SmsProvider,
};
use chrono::{Duration as ChronoDuration, Utc};
use smsgate_errors::{BreakerStoreError, MessageStoreError, QueueStoreError, StatusStoreError};
use smsgate_service::{DispatchTask, MessageStore, Priority, SmsStatus, StatusBufferStore, StatusUpdate};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Tunables of a dispatch worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Transport-level attempts before a submission fails permanently.
    pub max_retries: u32,
    /// Base of the exponential backoff; attempt `n` waits `base * 2^n`.
    pub retry_backoff: Duration,
    /// How long a task is deferred when the circuit is open.
    pub breaker_defer: Duration,
    /// Idle sleep between polls of an empty queue.
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_retries: 3,
            retry_backoff: Duration::from_secs(60),
            breaker_defer: Duration::from_secs(60),
            idle_poll: Duration::from_millis(200),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueStoreError),
    #[error(transparent)]
    Message(#[from] MessageStoreError),
    #[error(transparent)]
    Status(#[from] StatusStoreError),
    #[error(transparent)]
    Breaker(#[from] BreakerStoreError),
}

/// One consumer of a priority dispatch queue.
///
/// Per task: probe the circuit breaker (open circuits defer the task), load
/// the submission row, call the provider, and funnel the terminal outcome
/// through the status buffer. Transport errors retry with exponential
/// backoff through the delayed set; provider rejections are definitive.
#[derive(Clone)]
pub struct DispatchWorker<Q, M, S, B, P> {
    queues: Q,
    messages: M,
    status_buffer: S,
    breaker: CircuitBreaker<B>,
    provider: P,
    config: WorkerConfig,
}

impl<Q, M, S, B, P> DispatchWorker<Q, M, S, B, P>
where
    Q: DispatchQueueStore + Clone + Send + Sync + 'static,
    M: MessageStore + Clone + Send + Sync + 'static,
    S: StatusBufferStore + Clone + Send + Sync + 'static,
    B: CircuitBreakerStore + Clone + Send + Sync + 'static,
    P: SmsProvider + Clone + Send + Sync + 'static,
{
    pub fn new(
        queues: Q,
        messages: M,
        status_buffer: S,
        breaker: CircuitBreaker<B>,
        provider: P,
        config: WorkerConfig,
    ) -> Self {
        DispatchWorker {
            queues,
            messages,
            status_buffer,
            breaker,
            provider,
            config,
        }
    }

    /// Drains the queue until shutdown. Acknowledgment is late: the task
    /// leaves the in-flight list only after `process_task` returned, so an
    /// unacked task survives a process death and is requeued at startup.
    pub async fn run(self, priority: Priority, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                debug!(%priority, "worker draining complete, shutting down");
                return;
            }
            match self.queues.reserve_task(priority).await {
                Ok(Some(reserved)) => {
                    if let Err(err) = self.process_task(&reserved.task).await {
                        error!(id = %reserved.task.id, "error processing dispatch task: {}", err);
                    }
                    if let Err(err) = self.queues.ack_task(&reserved).await {
                        error!(id = %reserved.task.id, "error acknowledging dispatch task: {}", err);
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(%priority, "error polling dispatch queue: {}", err);
                    tokio::time::sleep(self.config.idle_poll).await;
                }
            }
        }
    }

    pub async fn process_task(&self, task: &DispatchTask) -> Result<(), WorkerError> {
        if self.breaker.is_open().await? {
            warn!(
                id = %task.id,
                service = %self.breaker.service_name(),
                "circuit breaker is open, deferring dispatch"
            );
            self.defer(task.clone(), self.config.breaker_defer).await?;
            return Ok(());
        }

        let message = match self.messages.load_message(task.id).await? {
            Some(message) => message,
            None => {
                // Raced by the batcher requeue or already gone; nothing to do.
                warn!(id = %task.id, "submission not found during dispatch, dropping");
                return Ok(());
            }
        };

        if message.status == SmsStatus::Cancelled {
            debug!(id = %task.id, "submission was cancelled, dropping task");
            return Ok(());
        }

        match self.provider.send(&message.recipient, &message.message).await {
            Ok(()) => {
                self.breaker.record_success().await?;
                self.status_buffer
                    .push_status_update(&StatusUpdate::sent(task.id))
                    .await?;
                debug!(id = %task.id, recipient = %message.recipient, "submission dispatched");
            }
            Err(ProviderError::Rejected(reason)) => {
                // Definitive answer from the provider, not worth a retry.
                warn!(id = %task.id, %reason, "provider rejected submission");
                self.status_buffer
                    .push_status_update(&StatusUpdate::failed(
                        task.id,
                        format!("provider rejected: {}", reason),
                    ))
                    .await?;
            }
            Err(ProviderError::Transport(reason)) => {
                error!(id = %task.id, %reason, "transport error dispatching submission");
                self.breaker.record_failure().await?;
                if task.attempt < self.config.max_retries {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(task.attempt);
                    self.defer(task.next_attempt(), backoff).await?;
                } else {
                    self.status_buffer
                        .push_status_update(&StatusUpdate::failed(
                            task.id,
                            format!("max retries exceeded: {}", reason),
                        ))
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn defer(&self, task: DispatchTask, delay: Duration) -> Result<(), QueueStoreError> {
        let ready_at = Utc::now() + ChronoDuration::seconds(delay.as_secs() as i64);
        self.queues.push_task_delayed(&task, ready_at).await
    }
}
