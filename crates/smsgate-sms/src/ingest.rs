use crate::{IngestBufferStore, JobError};
use smsgate_dispatch::DispatchQueueStore;
use smsgate_service::{DispatchTask, JobLockStore, MessageStore, NewSubmission};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Advisory lock name guarding the ingest tick.
pub static INGEST_LOCK_NAME: &str = "lock_batch_ingest_sms";

const INGEST_LOCK_TTL_SECONDS: u64 = 60 * 5;

#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Items drained from the buffer per tick.
    pub batch_size: usize,
    /// Tick interval; the acceptor's high-water nudge can run a tick early.
    pub interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_size: 5000,
            interval: Duration::from_secs(2),
        }
    }
}

/// Drains the ingest buffer into the durable store.
///
/// A single leader (the advisory lock holder) pops up to a batch of raw
/// items, bulk-inserts them as `queued` rows with conflict-ignore on the id,
/// and emits a dispatch task for every item without a scheduled time. When
/// the bulk insert fails the popped items go back to the head of the buffer
/// and the tick is aborted - the batch is never half-applied.
#[derive(Clone)]
pub struct IngestBatcher<S, M, Q> {
    store: S,
    messages: M,
    queues: Q,
    config: IngestConfig,
}

impl<S, M, Q> IngestBatcher<S, M, Q>
where
    S: IngestBufferStore + JobLockStore + Clone + Send + Sync + 'static,
    M: MessageStore + Clone + Send + Sync + 'static,
    Q: DispatchQueueStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, messages: M, queues: Q, config: IngestConfig) -> Self {
        IngestBatcher {
            store,
            messages,
            queues,
            config,
        }
    }

    /// One guarded tick. Returns the number of submissions ingested.
    pub async fn run_once(&self) -> Result<usize, JobError> {
        if !self
            .store
            .acquire_job_lock(INGEST_LOCK_NAME, INGEST_LOCK_TTL_SECONDS)
            .await?
        {
            warn!("previous batch ingestion is still running, skipping this run");
            return Ok(0);
        }

        let result = self.drain_buffer().await;
        if let Err(err) = self.store.release_job_lock(INGEST_LOCK_NAME).await {
            error!("failed to release ingest lock: {}", err);
        }
        result
    }

    async fn drain_buffer(&self) -> Result<usize, JobError> {
        let raw_items = self.store.pop_submissions(self.config.batch_size).await?;
        if raw_items.is_empty() {
            return Ok(0);
        }

        let mut submissions = Vec::with_capacity(raw_items.len());
        let mut parseable = Vec::with_capacity(raw_items.len());
        for raw in &raw_items {
            match serde_json::from_str::<NewSubmission>(raw) {
                Ok(submission) => {
                    submissions.push(submission);
                    parseable.push(raw.clone());
                }
                // A poison item would requeue forever; drop it loudly.
                Err(err) => error!("error parsing ingest buffer item, dropping: {}", err),
            }
        }

        if submissions.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.messages.insert_submissions(&submissions).await {
            error!(
                "failed to ingest batch, pushing {} items back: {}",
                parseable.len(),
                err
            );
            self.store.requeue_submissions(&parseable).await?;
            return Err(err.into());
        }

        let mut dispatched = 0;
        for submission in &submissions {
            if submission.scheduled_at.is_none() {
                let task = DispatchTask::new(submission.id, submission.priority);
                if let Err(err) = self.queues.push_task(&task).await {
                    // The scheduled-send/retry sweeps will pick the row up;
                    // the insert already committed.
                    error!(id = %submission.id, "error enqueueing dispatch task: {}", err);
                } else {
                    dispatched += 1;
                }
            }
        }

        info!(
            ingested = submissions.len(),
            dispatched, "ingested new submissions into the durable store"
        );
        Ok(submissions.len())
    }

    /// Periodic loop: a tick every `interval`, plus early ticks when the
    /// acceptor reports the buffer crossed its high-water mark. Exits fast
    /// on shutdown.
    pub async fn run(self, nudge: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = nudge.notified() => {
                    debug!("ingest buffer high-water mark reached, running early");
                }
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                debug!("ingest batcher exiting for shutdown");
                return;
            }
            if let Err(err) = self.run_once().await {
                error!("error during batch ingest: {}", err);
            }
        }
    }
}
