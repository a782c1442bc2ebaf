use crate::JobError;
use smsgate_dispatch::DispatchQueueStore;
use smsgate_service::{DispatchTask, JobLockStore, MessageStore};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Advisory lock name guarding the scheduled-send tick.
pub static SCHEDULED_LOCK_NAME: &str = "lock_process_scheduled_sms";
/// Advisory lock name guarding the retry sweep tick.
pub static RETRY_LOCK_NAME: &str = "lock_retry_failed_sms";

const SWEEP_LOCK_TTL_SECONDS: u64 = 60;
const SWEEP_BATCH: u32 = 1000;

/// Finds queued submissions whose scheduled time has arrived and enqueues
/// them on the priority-appropriate dispatch queue. The claim clears the
/// schedule mark in the same statement, so each row is handed out once.
#[derive(Clone)]
pub struct ScheduledSendGate<S, M, Q> {
    locks: S,
    messages: M,
    queues: Q,
    interval: Duration,
}

impl<S, M, Q> ScheduledSendGate<S, M, Q>
where
    S: JobLockStore + Clone + Send + Sync + 'static,
    M: MessageStore + Clone + Send + Sync + 'static,
    Q: DispatchQueueStore + Clone + Send + Sync + 'static,
{
    pub fn new(locks: S, messages: M, queues: Q, interval: Duration) -> Self {
        ScheduledSendGate {
            locks,
            messages,
            queues,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<usize, JobError> {
        if !self
            .locks
            .acquire_job_lock(SCHEDULED_LOCK_NAME, SWEEP_LOCK_TTL_SECONDS)
            .await?
        {
            warn!("previous scheduled-send pass is still running, skipping");
            return Ok(0);
        }
        let result = self.dispatch_due().await;
        if let Err(err) = self.locks.release_job_lock(SCHEDULED_LOCK_NAME).await {
            error!("failed to release scheduled-send lock: {}", err);
        }
        result
    }

    async fn dispatch_due(&self) -> Result<usize, JobError> {
        let due = self.messages.claim_due_scheduled(SWEEP_BATCH).await?;
        let count = due.len();
        for (id, priority) in due {
            self.queues
                .push_task(&DispatchTask::new(id, priority))
                .await?;
        }
        if count > 0 {
            info!(count, "dispatched scheduled submissions");
        }
        Ok(count)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let interval = self.interval;
        run_periodic("scheduled-send gate", interval, shutdown, move || {
            let gate = self.clone();
            async move { gate.run_once().await.map(|_| ()) }
        })
        .await;
    }
}

/// Flips `failed` submissions that still have retry budget back to `queued`
/// and re-enqueues them.
#[derive(Clone)]
pub struct RetrySweep<S, M, Q> {
    locks: S,
    messages: M,
    queues: Q,
    max_retries: i32,
    interval: Duration,
}

impl<S, M, Q> RetrySweep<S, M, Q>
where
    S: JobLockStore + Clone + Send + Sync + 'static,
    M: MessageStore + Clone + Send + Sync + 'static,
    Q: DispatchQueueStore + Clone + Send + Sync + 'static,
{
    pub fn new(locks: S, messages: M, queues: Q, max_retries: i32, interval: Duration) -> Self {
        RetrySweep {
            locks,
            messages,
            queues,
            max_retries,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<usize, JobError> {
        if !self
            .locks
            .acquire_job_lock(RETRY_LOCK_NAME, SWEEP_LOCK_TTL_SECONDS)
            .await?
        {
            warn!("previous retry sweep is still running, skipping");
            return Ok(0);
        }
        let result = self.requeue().await;
        if let Err(err) = self.locks.release_job_lock(RETRY_LOCK_NAME).await {
            error!("failed to release retry sweep lock: {}", err);
        }
        result
    }

    async fn requeue(&self) -> Result<usize, JobError> {
        let retryable = self
            .messages
            .requeue_failed(self.max_retries, SWEEP_BATCH)
            .await?;
        let count = retryable.len();
        for (id, priority) in retryable {
            self.queues
                .push_task(&DispatchTask::new(id, priority))
                .await?;
        }
        if count > 0 {
            info!(count, "requeued failed submissions with retry budget");
        }
        Ok(count)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let interval = self.interval;
        run_periodic("retry sweep", interval, shutdown, move || {
            let sweep = self.clone();
            async move { sweep.run_once().await.map(|_| ()) }
        })
        .await;
    }
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), JobError>>,
{
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            debug!("{} exiting for shutdown", name);
            return;
        }
        if let Err(err) = tick().await {
            error!("error during {}: {}", name, err);
        }
    }
}
