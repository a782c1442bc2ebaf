// The informal schema of our data in redis:
//   user_balance_<id>                string   working balance for admission
//   pending_deduct_<id>              string   reserved-but-unsettled amounts
//   lock_balance_<id>                string   balance repopulation mutex
//   idempotency:<tenant>:<req>       string   "processing", 24h TTL
//   sms_ingest_buffer                list     accepted submissions
//   sms_status_buffer                list     worker status updates
//   sms_dispatch:normal              list     dispatch queue
//   sms_dispatch:express             list     dispatch queue
//   sms_dispatch:<prio>:inflight     list     reserved, unacked tasks
//   sms_dispatch:delayed             zset     deferred tasks, score = ready ts
//   circuit_breaker:<svc>:failures   counter
//   circuit_breaker:<svc>:open       flag with TTL
//   ratelimit:sliding:<id>           zset     one-minute request window
//   lock_*                           string   advisory job locks
// For interactive exploration, use the redis-cli tool: `keys *`,
// `lrange <key> 0 -1`, `zrange <key> 0 -1 WITHSCORES`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use rust_decimal::Decimal;
use smsgate_credits::{BalanceCacheStore, ReserveStatus};
use smsgate_dispatch::{CircuitBreakerStore, DispatchQueueStore, ReservedTask};
use smsgate_errors::{
    BalanceStoreError, BreakerStoreError, IdempotencyStoreError, LockStoreError, QueueStoreError,
    RateLimitStoreError, StatusStoreError,
};
use smsgate_service::{
    DispatchTask, HealthCheckStore, JobLockStore, NewSubmission, Priority, RateLimitStore,
    StatusBufferStore, StatusUpdate,
};
use smsgate_sms::{IdempotencyStore, IngestBufferStore};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

static INGEST_BUFFER_KEY: &str = "sms_ingest_buffer";
static STATUS_BUFFER_KEY: &str = "sms_status_buffer";
static DELAYED_TASKS_KEY: &str = "sms_dispatch:delayed";

static BALANCE_KEY_PREFIX: &str = "user_balance_";
static PENDING_KEY_PREFIX: &str = "pending_deduct_";
static BALANCE_LOCK_PREFIX: &str = "lock_balance_";

const IDEMPOTENCY_TTL_SECONDS: u64 = 86_400;
const BALANCE_LOCK_WAIT: Duration = Duration::from_secs(3);
const BALANCE_LOCK_EXPIRY_MILLIS: u64 = 5_000;
const BALANCE_LOCK_RETRY: Duration = Duration::from_millis(100);
const RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const PROMOTE_BATCH: usize = 1000;

fn balance_key(account_id: Uuid) -> String {
    format!("{}{}", BALANCE_KEY_PREFIX, account_id)
}

fn pending_key(account_id: Uuid) -> String {
    format!("{}{}", PENDING_KEY_PREFIX, account_id)
}

fn balance_lock_key(account_id: Uuid) -> String {
    format!("{}{}", BALANCE_LOCK_PREFIX, account_id)
}

fn idempotency_key(account_id: Uuid, request_id: &str) -> String {
    format!("idempotency:{}:{}", account_id, request_id)
}

fn queue_key(priority: Priority) -> &'static str {
    match priority {
        Priority::Normal => "sms_dispatch:normal",
        Priority::Express => "sms_dispatch:express",
    }
}

fn inflight_key(priority: Priority) -> String {
    format!("sms_dispatch:{}:inflight", priority)
}

fn breaker_failures_key(service: &str) -> String {
    format!("circuit_breaker:{}:failures", service)
}

fn breaker_open_key(service: &str) -> String {
    format!("circuit_breaker:{}:open", service)
}

fn rate_limit_key(account_id: Uuid) -> String {
    format!("ratelimit:sliding:{}", account_id)
}

// The following Lua scripts execute their logic atomically inside Redis,
// which is what makes single-key invariants (reservation, refund) hold under
// concurrent acceptors without cross-process locks.

/// Checks and decrements the working balance while incrementing pending by
/// the same amount. Returns 1 ok, -1 insufficient, -2 cache miss, -3 corrupt.
static RESERVE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local balance_str = redis.call('get', KEYS[1])
        if not balance_str then
            return -2
        end
        local balance = tonumber(balance_str)
        local amount = tonumber(ARGV[1])
        if not balance or not amount then
            return -3
        end
        if balance < amount then
            return -1
        end
        redis.call('incrbyfloat', KEYS[1], -amount)
        redis.call('incrbyfloat', KEYS[2], amount)
        return 1
        "#,
    )
});

/// Returns a cancelled reservation: balance goes back up, pending is drained
/// by the same amount, clamped at zero so an already-settled reservation
/// cannot push pending negative.
static REFUND_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        redis.call('incrbyfloat', KEYS[1], ARGV[1])
        local pending = tonumber(redis.call('get', KEYS[2]))
        if pending then
            local amount = tonumber(ARGV[1])
            if pending < amount then
                amount = pending
            end
            if amount > 0 then
                redis.call('incrbyfloat', KEYS[2], -amount)
            end
        end
        return 1
        "#,
    )
});

/// Applies a durable charge to the cache: increment when warm, seed with the
/// fresh durable balance when cold.
static APPLY_CHARGE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('exists', KEYS[1]) == 1 then
            redis.call('incrbyfloat', KEYS[1], ARGV[1])
        else
            redis.call('set', KEYS[1], ARGV[2])
        end
        return 1
        "#,
    )
});

/// Deletes a lock key only if it still carries the caller's token.
static RELEASE_LOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('del', KEYS[1])
        end
        return 0
        "#,
    )
});

/// Moves due delayed tasks back onto their priority queues.
static PROMOTE_DELAYED_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
        for _, raw in ipairs(due) do
            local task = cjson.decode(raw)
            if task.priority == 'express' then
                redis.call('rpush', KEYS[3], raw)
            else
                redis.call('rpush', KEYS[2], raw)
            end
            redis.call('zrem', KEYS[1], raw)
        end
        return #due
        "#,
    )
});

/// Sliding one-minute request window. Returns 1 when over the limit (and
/// removes the over-limit hit from the window).
static RATE_LIMIT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        redis.call('zremrangebyscore', KEYS[1], 0, ARGV[1])
        redis.call('zadd', KEYS[1], ARGV[2], ARGV[3])
        local count = redis.call('zcard', KEYS[1])
        redis.call('expire', KEYS[1], 120)
        if count > tonumber(ARGV[4]) then
            redis.call('zrem', KEYS[1], ARGV[3])
            return 1
        end
        return 0
        "#,
    )
});

/// Builder for the Redis store
pub struct RedisStoreBuilder {
    redis_url: String,
}

impl RedisStoreBuilder {
    pub fn new(redis_url: impl Into<String>) -> Self {
        RedisStoreBuilder {
            redis_url: redis_url.into(),
        }
    }

    /// Connects with a multiplexed tokio connection shared by all clones of
    /// the store.
    pub async fn connect(&self) -> Result<RedisStore, redis::RedisError> {
        let client = Client::open(self.redis_url.as_str())?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        debug!("connected to redis: {:?}", client);
        Ok(RedisStore { connection })
    }
}

/// The hot store.
///
/// All balance mutation on this side goes through atomic Lua scripts; the
/// rest are plain list/zset/key commands. Clones share one multiplexed
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    async fn parse_decimal_key(
        &self,
        key: &str,
        account_id: Uuid,
    ) -> Result<Option<Decimal>, BalanceStoreError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(key).await?;
        match raw {
            None => Ok(None),
            Some(raw) => match parse_amount(&raw) {
                Some(amount) => Ok(Some(amount)),
                None => {
                    // Self-heal: drop the poisoned key so the next read
                    // repopulates from the durable store.
                    error!(%account_id, key, critical = true, "deleting corrupted balance key");
                    let _: () = connection.del(key).await?;
                    Err(BalanceStoreError::Corrupt(account_id))
                }
            },
        }
    }
}

/// INCRBYFLOAT stores float representations; normalize back to two decimal
/// places when reading amounts out of the cache.
fn parse_amount(raw: &str) -> Option<Decimal> {
    match Decimal::from_str(raw) {
        Ok(amount) => Some(amount.round_dp(2)),
        Err(_) => f64::from_str(raw)
            .ok()
            .and_then(Decimal::from_f64_retain)
            .map(|amount| amount.round_dp(2)),
    }
}

#[async_trait]
impl BalanceCacheStore for RedisStore {
    async fn get_cached_balance(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Decimal>, BalanceStoreError> {
        self.parse_decimal_key(&balance_key(account_id), account_id)
            .await
    }

    async fn set_cached_balance(
        &self,
        account_id: Uuid,
        balance: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .set(balance_key(account_id), balance.to_string())
            .await?;
        Ok(())
    }

    async fn reserve(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<ReserveStatus, BalanceStoreError> {
        let mut connection = self.connection.clone();
        let result: i64 = RESERVE_SCRIPT
            .key(balance_key(account_id))
            .key(pending_key(account_id))
            .arg(amount.to_string())
            .invoke_async(&mut connection)
            .await?;
        match result {
            1 => Ok(ReserveStatus::Ok),
            -1 => Ok(ReserveStatus::Insufficient),
            -2 => Ok(ReserveStatus::Miss),
            _ => {
                error!(%account_id, critical = true, "deleting corrupted balance key");
                let _: () = connection.del(balance_key(account_id)).await?;
                Ok(ReserveStatus::Corrupt)
            }
        }
    }

    async fn apply_charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        fresh_balance: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = APPLY_CHARGE_SCRIPT
            .key(balance_key(account_id))
            .arg(amount.to_string())
            .arg(fresh_balance.to_string())
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn refund_cancellation(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = REFUND_SCRIPT
            .key(balance_key(account_id))
            .key(pending_key(account_id))
            .arg(amount.to_string())
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn pending_amount(&self, account_id: Uuid) -> Result<Decimal, BalanceStoreError> {
        Ok(self
            .parse_decimal_key(&pending_key(account_id), account_id)
            .await?
            .unwrap_or_default())
    }

    async fn decrement_pending(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), BalanceStoreError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("INCRBYFLOAT")
            .arg(pending_key(account_id))
            .arg(format!("-{}", amount))
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn pending_accounts(&self) -> Result<Vec<Uuid>, BalanceStoreError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}*", PENDING_KEY_PREFIX);
        let keys: Vec<String> = {
            let mut iter = connection.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(PENDING_KEY_PREFIX))
            .filter_map(|suffix| Uuid::from_str(suffix).ok())
            .collect())
    }

    async fn acquire_balance_lock(
        &self,
        account_id: Uuid,
    ) -> Result<Option<String>, BalanceStoreError> {
        let mut connection = self.connection.clone();
        let key = balance_lock_key(account_id);
        let token = Uuid::now_v7().to_string();
        let deadline = Instant::now() + BALANCE_LOCK_WAIT;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(BALANCE_LOCK_EXPIRY_MILLIS)
                .query_async(&mut connection)
                .await?;
            if acquired.is_some() {
                return Ok(Some(token));
            }
            if Instant::now() >= deadline {
                warn!(%account_id, "timed out waiting for balance lock");
                return Ok(None);
            }
            tokio::time::sleep(BALANCE_LOCK_RETRY).await;
        }
    }

    async fn release_balance_lock(
        &self,
        account_id: Uuid,
        token: String,
    ) -> Result<(), BalanceStoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = RELEASE_LOCK_SCRIPT
            .key(balance_lock_key(account_id))
            .arg(token)
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn claim_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<bool, IdempotencyStoreError> {
        let mut connection = self.connection.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(idempotency_key(account_id, request_id))
            .arg("processing")
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECONDS)
            .query_async(&mut connection)
            .await?;
        Ok(claimed.is_some())
    }

    async fn release_request_id(
        &self,
        account_id: Uuid,
        request_id: &str,
    ) -> Result<(), IdempotencyStoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .del(idempotency_key(account_id, request_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IngestBufferStore for RedisStore {
    async fn push_submission(
        &self,
        submission: &NewSubmission,
    ) -> Result<usize, StatusStoreError> {
        let raw = serde_json::to_string(submission)
            .map_err(|err| StatusStoreError::Other(Box::new(err)))?;
        let mut connection = self.connection.clone();
        let length: usize = connection.rpush(INGEST_BUFFER_KEY, raw).await?;
        Ok(length)
    }

    async fn pop_submissions(&self, count: usize) -> Result<Vec<String>, StatusStoreError> {
        pop_list(self.connection.clone(), INGEST_BUFFER_KEY, count).await
    }

    async fn requeue_submissions(&self, raw_items: &[String]) -> Result<(), StatusStoreError> {
        if raw_items.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let _: () = connection.lpush(INGEST_BUFFER_KEY, raw_items).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusBufferStore for RedisStore {
    async fn push_status_update(&self, update: &StatusUpdate) -> Result<(), StatusStoreError> {
        let raw = serde_json::to_string(update)
            .map_err(|err| StatusStoreError::Other(Box::new(err)))?;
        let mut connection = self.connection.clone();
        let _: () = connection.rpush(STATUS_BUFFER_KEY, raw).await?;
        Ok(())
    }

    async fn pop_status_updates(&self, count: usize) -> Result<Vec<String>, StatusStoreError> {
        pop_list(self.connection.clone(), STATUS_BUFFER_KEY, count).await
    }
}

async fn pop_list(
    mut connection: MultiplexedConnection,
    key: &str,
    count: usize,
) -> Result<Vec<String>, StatusStoreError> {
    let count = match NonZeroUsize::new(count) {
        Some(count) => count,
        None => return Ok(Vec::new()),
    };
    let items: Vec<String> = connection.lpop(key, Some(count)).await?;
    Ok(items)
}

#[async_trait]
impl JobLockStore for RedisStore {
    async fn acquire_job_lock(&self, name: &str, ttl_seconds: u64) -> Result<bool, LockStoreError> {
        let mut connection = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg("true")
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut connection)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_job_lock(&self, name: &str) -> Result<(), LockStoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(name).await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueueStore for RedisStore {
    async fn push_task(&self, task: &DispatchTask) -> Result<(), QueueStoreError> {
        let raw =
            serde_json::to_string(task).map_err(|err| QueueStoreError::Other(Box::new(err)))?;
        let mut connection = self.connection.clone();
        let _: () = connection.rpush(queue_key(task.priority), raw).await?;
        Ok(())
    }

    async fn push_task_delayed(
        &self,
        task: &DispatchTask,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let raw =
            serde_json::to_string(task).map_err(|err| QueueStoreError::Other(Box::new(err)))?;
        let mut connection = self.connection.clone();
        let _: () = connection
            .zadd(DELAYED_TASKS_KEY, raw, ready_at.timestamp())
            .await?;
        Ok(())
    }

    async fn reserve_task(
        &self,
        priority: Priority,
    ) -> Result<Option<ReservedTask>, QueueStoreError> {
        let mut connection = self.connection.clone();
        let inflight = inflight_key(priority);
        let raw: Option<String> = connection.rpoplpush(queue_key(priority), &inflight).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<DispatchTask>(&raw) {
            Ok(task) => Ok(Some(ReservedTask { task, raw })),
            Err(err) => {
                // Poison payload; drop it from the in-flight list so it does
                // not come back on every restart.
                error!("unparseable dispatch task, dropping: {}", err);
                let _: () = connection.lrem(&inflight, 1, &raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack_task(&self, task: &ReservedTask) -> Result<(), QueueStoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .lrem(inflight_key(task.task.priority), 1, &task.raw)
            .await?;
        Ok(())
    }

    async fn promote_due_tasks(&self, now: DateTime<Utc>) -> Result<usize, QueueStoreError> {
        let mut connection = self.connection.clone();
        let promoted: usize = PROMOTE_DELAYED_SCRIPT
            .key(DELAYED_TASKS_KEY)
            .key(queue_key(Priority::Normal))
            .key(queue_key(Priority::Express))
            .arg(now.timestamp())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut connection)
            .await?;
        Ok(promoted)
    }

    async fn requeue_inflight(&self, priority: Priority) -> Result<usize, QueueStoreError> {
        let mut connection = self.connection.clone();
        let inflight = inflight_key(priority);
        let mut requeued = 0;
        loop {
            let raw: Option<String> = connection.rpoplpush(inflight.as_str(), queue_key(priority)).await?;
            if raw.is_none() {
                return Ok(requeued);
            }
            requeued += 1;
        }
    }
}

#[async_trait]
impl CircuitBreakerStore for RedisStore {
    async fn increment_failures(
        &self,
        service: &str,
        ttl: Duration,
    ) -> Result<u64, BreakerStoreError> {
        let mut connection = self.connection.clone();
        let key = breaker_failures_key(service);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(&key);
        pipe.cmd("EXPIRE").arg(&key).arg(ttl.as_secs()).ignore();
        let (failures,): (u64,) = pipe.query_async(&mut connection).await?;
        Ok(failures)
    }

    async fn clear_failures(&self, service: &str) -> Result<(), BreakerStoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(breaker_failures_key(service)).await?;
        Ok(())
    }

    async fn open_circuit(&self, service: &str, ttl: Duration) -> Result<(), BreakerStoreError> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(breaker_open_key(service))
            .arg("1")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn is_circuit_open(&self, service: &str) -> Result<bool, BreakerStoreError> {
        let mut connection = self.connection.clone();
        let open: bool = connection.exists(breaker_open_key(service)).await?;
        Ok(open)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn is_rate_limited(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<bool, RateLimitStoreError> {
        let mut connection = self.connection.clone();
        let now = Utc::now();
        let now_micros = now.timestamp_micros();
        let window_start = now_micros - (RATE_LIMIT_WINDOW_SECONDS as i64) * 1_000_000;
        // The member doubles as the hit's unique identity within the window.
        let member = format!("{}-{}", now_micros, Uuid::now_v7());
        let limited: i64 = RATE_LIMIT_SCRIPT
            .key(rate_limit_key(account_id))
            .arg(window_start)
            .arg(now_micros)
            .arg(member)
            .arg(limit)
            .invoke_async(&mut connection)
            .await?;
        Ok(limited == 1)
    }
}

#[async_trait]
impl HealthCheckStore for RedisStore {
    async fn is_healthy(&self) -> bool {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_documented_layout() {
        let id = Uuid::nil();
        assert_eq!(
            balance_key(id),
            "user_balance_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            pending_key(id),
            "pending_deduct_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            balance_lock_key(id),
            "lock_balance_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            idempotency_key(id, "R"),
            "idempotency:00000000-0000-0000-0000-000000000000:R"
        );
        assert_eq!(queue_key(Priority::Express), "sms_dispatch:express");
        assert_eq!(inflight_key(Priority::Normal), "sms_dispatch:normal:inflight");
        assert_eq!(
            breaker_failures_key("sms_provider_primary"),
            "circuit_breaker:sms_provider_primary:failures"
        );
        assert_eq!(
            breaker_open_key("sms_provider_primary"),
            "circuit_breaker:sms_provider_primary:open"
        );
    }

    #[test]
    fn amounts_survive_incrbyfloat_representations() {
        assert_eq!(parse_amount("90"), Some(Decimal::new(90, 0)));
        assert_eq!(parse_amount("89.9"), Some(Decimal::new(8990, 2)));
        assert_eq!(parse_amount("89.90000000000001"), Some(Decimal::new(8990, 2)));
        assert_eq!(parse_amount("not-a-number"), None);
    }
}
