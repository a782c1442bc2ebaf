use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use smsgate_api::{api_filter, SmsGatewayApi};
use smsgate_credits::CreditService;
use smsgate_dispatch::{
    CircuitBreaker, DispatchQueueStore, DispatchWorker, StubProvider, WorkerConfig,
};
use smsgate_service::{JobLockStore, PartitionStore, Priority};
use smsgate_sms::{
    AcceptorConfig, IngestBatcher, IngestConfig, RetrySweep, ScheduledSendGate, StatusWriteback,
    WritebackConfig,
};
use smsgate_store::{PgStore, RedisStore, RedisStoreBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

static SETTLEMENT_LOCK_NAME: &str = "lock_sync_credit_balances";
static PARTITION_LOCK_NAME: &str = "lock_maintain_partitions";
static PROVIDER_SERVICE_NAME: &str = "sms_provider_primary";

/// How often delayed dispatch tasks are promoted back onto their queues.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_database_url() -> String {
    "postgres://127.0.0.1/smsgate".to_owned()
}

fn default_http_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000))
}

fn default_sms_cost() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_express_multiplier() -> Decimal {
    Decimal::new(20, 1) // 2.0
}

fn default_rate_limit() -> u32 {
    100
}

fn default_breaker_threshold() -> u64 {
    10
}

fn default_breaker_recovery() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_ingest_batch_size() -> usize {
    5000
}

fn default_status_batch_size() -> usize {
    1000
}

fn default_ingest_interval() -> u64 {
    2
}

fn default_status_interval() -> u64 {
    5
}

fn default_settlement_interval() -> u64 {
    60
}

fn default_scheduled_send_interval() -> u64 {
    30
}

fn default_retry_sweep_interval() -> u64 {
    300
}

fn default_partition_check_interval() -> u64 {
    60 * 60 * 24 * 30
}

fn default_express_pool_size() -> usize {
    4
}

fn default_normal_pool_size() -> usize {
    8
}

fn default_provider_success_rate() -> f64 {
    0.95
}

/// Node configuration, merged from defaults, an optional config file and
/// `SMSGATE_*` environment variables.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_http_bind_address")]
    pub http_bind_address: SocketAddr,
    #[serde(default = "default_sms_cost")]
    pub sms_cost_per_message: Decimal,
    #[serde(default = "default_express_multiplier")]
    pub express_multiplier: Decimal,
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit_per_minute: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u64,
    #[serde(default = "default_breaker_recovery")]
    pub breaker_recovery_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,
    #[serde(default = "default_status_batch_size")]
    pub status_batch_size: usize,
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_seconds: u64,
    #[serde(default = "default_status_interval")]
    pub status_flush_interval_seconds: u64,
    #[serde(default = "default_settlement_interval")]
    pub settlement_interval_seconds: u64,
    #[serde(default = "default_scheduled_send_interval")]
    pub scheduled_send_interval_seconds: u64,
    #[serde(default = "default_retry_sweep_interval")]
    pub retry_sweep_interval_seconds: u64,
    #[serde(default = "default_partition_check_interval")]
    pub partition_check_interval_seconds: u64,
    #[serde(default = "default_express_pool_size")]
    pub express_pool_size: usize,
    #[serde(default = "default_normal_pool_size")]
    pub normal_pool_size: usize,
    #[serde(default = "default_provider_success_rate")]
    pub provider_success_rate: f64,
}

/// The node: HTTP surface, worker pools and every periodic job in one
/// process. Multiple nodes can share the same Redis and Postgres; the
/// advisory locks keep each periodic tick on a single instance.
pub struct SmsGatewayNode {
    config: NodeConfig,
}

impl SmsGatewayNode {
    pub fn new(config: NodeConfig) -> Self {
        SmsGatewayNode { config }
    }

    /// Connects the stores, spawns the background machinery and serves the
    /// HTTP API until ctrl-c.
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error>> {
        let config = self.config;
        let redis = RedisStoreBuilder::new(config.redis_url.as_str())
            .connect()
            .await?;
        let pg = PgStore::connect(&config.database_url).await?;
        info!("connected to hot and durable stores");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest_nudge = Arc::new(Notify::new());

        let acceptor_config = AcceptorConfig {
            base_cost: config.sms_cost_per_message,
            express_multiplier: config.express_multiplier,
            ingest_high_water: config.ingest_batch_size,
        };
        let api = SmsGatewayApi::new(
            redis.clone(),
            pg.clone(),
            acceptor_config,
            ingest_nudge.clone(),
        );
        let credits = CreditService::new(redis.clone(), pg.clone());

        // Tasks stranded in-flight by a previous process death go back to
        // their queues before the pools start.
        for priority in [Priority::Normal, Priority::Express] {
            let requeued = redis.requeue_inflight(priority).await?;
            if requeued > 0 {
                info!(%priority, requeued, "requeued stranded in-flight dispatch tasks");
            }
        }

        spawn_worker_pools(&config, redis.clone(), pg.clone(), shutdown_rx.clone());
        spawn_task_promoter(redis.clone(), shutdown_rx.clone());

        let batcher = IngestBatcher::new(
            redis.clone(),
            pg.clone(),
            redis.clone(),
            IngestConfig {
                batch_size: config.ingest_batch_size,
                interval: Duration::from_secs(config.ingest_interval_seconds),
            },
        );
        tokio::spawn(batcher.run(ingest_nudge, shutdown_rx.clone()));

        let writeback = StatusWriteback::new(
            redis.clone(),
            pg.clone(),
            WritebackConfig {
                batch_size: config.status_batch_size,
                interval: Duration::from_secs(config.status_flush_interval_seconds),
            },
        );
        tokio::spawn(writeback.run(shutdown_rx.clone()));

        let gate = ScheduledSendGate::new(
            redis.clone(),
            pg.clone(),
            redis.clone(),
            Duration::from_secs(config.scheduled_send_interval_seconds),
        );
        tokio::spawn(gate.run(shutdown_rx.clone()));

        let sweep = RetrySweep::new(
            redis.clone(),
            pg.clone(),
            redis.clone(),
            config.max_retries as i32,
            Duration::from_secs(config.retry_sweep_interval_seconds),
        );
        tokio::spawn(sweep.run(shutdown_rx.clone()));

        spawn_settlement_sweep(
            credits,
            redis.clone(),
            Duration::from_secs(config.settlement_interval_seconds),
            shutdown_rx.clone(),
        );
        spawn_partition_maintainer(
            pg,
            redis,
            Duration::from_secs(config.partition_check_interval_seconds),
            shutdown_rx.clone(),
        );

        let routes = api_filter(api);
        let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
            config.http_bind_address,
            shutdown_signal(shutdown_rx),
        );
        info!(%addr, "SMS gateway node listening");

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, draining");
                let _ = shutdown_tx.send(true);
            }
        });

        server.await;
        info!("node stopped");
        Ok(())
    }
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_worker_pools(
    config: &NodeConfig,
    redis: RedisStore,
    pg: PgStore,
    shutdown: watch::Receiver<bool>,
) {
    let breaker = CircuitBreaker::new(
        redis.clone(),
        PROVIDER_SERVICE_NAME,
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_recovery_timeout_seconds),
    );
    let provider = StubProvider::new(config.provider_success_rate);
    let worker = DispatchWorker::new(
        redis.clone(),
        pg,
        redis,
        breaker,
        provider,
        WorkerConfig {
            max_retries: config.max_retries,
            ..WorkerConfig::default()
        },
    );

    // The express pool is sized to drain within a heartbeat; the normal
    // pool absorbs the rest.
    for _ in 0..config.express_pool_size {
        tokio::spawn(worker.clone().run(Priority::Express, shutdown.clone()));
    }
    for _ in 0..config.normal_pool_size {
        tokio::spawn(worker.clone().run(Priority::Normal, shutdown.clone()));
    }
}

fn spawn_task_promoter(redis: RedisStore, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROMOTE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                return;
            }
            if let Err(err) = redis.promote_due_tasks(Utc::now()).await {
                error!("error promoting delayed dispatch tasks: {}", err);
            }
        }
    });
}

fn spawn_settlement_sweep(
    credits: CreditService<RedisStore, PgStore>,
    locks: RedisStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                return;
            }
            match locks.acquire_job_lock(SETTLEMENT_LOCK_NAME, period.as_secs()).await {
                Ok(true) => {
                    if let Err(err) = credits.settle_all().await {
                        error!("error during settlement sweep: {}", err);
                    }
                    if let Err(err) = locks.release_job_lock(SETTLEMENT_LOCK_NAME).await {
                        error!("failed to release settlement lock: {}", err);
                    }
                }
                Ok(false) => {}
                Err(err) => error!("error acquiring settlement lock: {}", err),
            }
        }
    });
}

fn spawn_partition_maintainer(
    pg: PgStore,
    locks: RedisStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                return;
            }
            match locks.acquire_job_lock(PARTITION_LOCK_NAME, 300).await {
                Ok(true) => {
                    let next_year = Utc::now().year() + 1;
                    match pg.ensure_year_partition(next_year).await {
                        Ok(Some(partition)) => {
                            info!(%partition, "created next yearly partition")
                        }
                        Ok(None) => {}
                        Err(err) => error!("failed to maintain partitions: {}", err),
                    }
                    if let Err(err) = locks.release_job_lock(PARTITION_LOCK_NAME).await {
                        error!("failed to release partition lock: {}", err);
                    }
                }
                Ok(false) => {}
                Err(err) => error!("error acquiring partition lock: {}", err),
            }
        }
    });
}
