use crate::JobError;
use smsgate_service::{JobLockStore, MessageStore, SmsStatus, StatusBufferStore, StatusUpdate};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Advisory lock name guarding the write-back tick.
pub static WRITEBACK_LOCK_NAME: &str = "lock_flush_sms_status";

const WRITEBACK_LOCK_TTL_SECONDS: u64 = 60;

#[derive(Clone, Debug)]
pub struct WritebackConfig {
    /// Items drained from the status buffer per tick.
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        WritebackConfig {
            batch_size: 1000,
            interval: Duration::from_secs(5),
        }
    }
}

/// Drains the status buffer into bulk durable updates.
///
/// Builds a last-write-wins map per id, then applies one bulk update per
/// target status. Parse errors on individual items are logged and skipped;
/// the batch does not roll back. Terminal-status protection lives in the
/// store's update statements: a buffered `sent`/`failed` never overrides
/// `cancelled`, and `sent` is never regressed.
#[derive(Clone)]
pub struct StatusWriteback<S, M> {
    store: S,
    messages: M,
    config: WritebackConfig,
}

impl<S, M> StatusWriteback<S, M>
where
    S: StatusBufferStore + JobLockStore + Clone + Send + Sync + 'static,
    M: MessageStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, messages: M, config: WritebackConfig) -> Self {
        StatusWriteback {
            store,
            messages,
            config,
        }
    }

    /// One guarded tick. Returns the number of rows updated.
    pub async fn flush_once(&self) -> Result<u64, JobError> {
        if !self
            .store
            .acquire_job_lock(WRITEBACK_LOCK_NAME, WRITEBACK_LOCK_TTL_SECONDS)
            .await?
        {
            warn!("previous status flush is still running, skipping this run");
            return Ok(0);
        }

        let result = self.flush_buffer().await;
        if let Err(err) = self.store.release_job_lock(WRITEBACK_LOCK_NAME).await {
            error!("failed to release status flush lock: {}", err);
        }
        result
    }

    async fn flush_buffer(&self) -> Result<u64, JobError> {
        let raw_items = self
            .store
            .pop_status_updates(self.config.batch_size)
            .await?;
        if raw_items.is_empty() {
            return Ok(0);
        }

        // Last write wins per id within the batch.
        let mut updates: HashMap<Uuid, StatusUpdate> = HashMap::new();
        for raw in &raw_items {
            match serde_json::from_str::<StatusUpdate>(raw) {
                Ok(update) => {
                    updates.insert(update.id, update);
                }
                Err(err) => error!("error parsing status buffer item: {}", err),
            }
        }

        let mut sent = Vec::new();
        let mut failed = Vec::new();
        for update in updates.into_values() {
            match update.status {
                SmsStatus::Sent => sent.push(update.id),
                SmsStatus::Failed => failed.push((update.id, update.reason)),
                other => warn!(
                    id = %update.id,
                    status = %other,
                    "unexpected status in write-back buffer, skipping"
                ),
            }
        }

        if sent.is_empty() && failed.is_empty() {
            return Ok(0);
        }

        let updated = self.messages.apply_status_updates(&sent, &failed).await?;
        info!(updated, "bulk updated submission statuses from buffer");
        Ok(updated)
    }

    /// Periodic loop; skipped entirely during graceful shutdown so the
    /// process can exit fast (buffered updates are re-derived by the retry
    /// sweep on the next provider pass).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                debug!("skipping status flush due to shutdown");
                return;
            }
            if let Err(err) = self.flush_once().await {
                error!("error flushing status buffer: {}", err);
            }
        }
    }
}
