use async_trait::async_trait;
use smsgate_errors::BreakerStoreError;
use std::time::Duration;
use tracing::warn;

/// Hot-store state behind a circuit breaker: a failure counter and an
/// open-flag key, both expiring on their own.
#[async_trait]
pub trait CircuitBreakerStore {
    /// Atomically increments the failure counter and refreshes its TTL.
    /// Returns the new count.
    async fn increment_failures(
        &self,
        service: &str,
        ttl: Duration,
    ) -> Result<u64, BreakerStoreError>;

    /// Deletes the failure counter.
    async fn clear_failures(&self, service: &str) -> Result<(), BreakerStoreError>;

    /// Sets the open flag with the given TTL.
    async fn open_circuit(&self, service: &str, ttl: Duration) -> Result<(), BreakerStoreError>;

    /// Truthy iff the open flag exists.
    async fn is_circuit_open(&self, service: &str) -> Result<bool, BreakerStoreError>;
}

/// Per-downstream failure gate.
///
/// Closed while the failure counter stays under the threshold; once it
/// reaches the threshold the open flag is set for `recovery_timeout` and all
/// probes short-circuit to a deferred retry. The flag ages out on its own -
/// the first call after expiry is the half-open probe. A success deletes the
/// counter but never clears an already-open flag.
#[derive(Clone)]
pub struct CircuitBreaker<S> {
    store: S,
    service_name: String,
    failure_threshold: u64,
    recovery_timeout: Duration,
}

impl<S> CircuitBreaker<S>
where
    S: CircuitBreakerStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        service_name: impl Into<String>,
        failure_threshold: u64,
        recovery_timeout: Duration,
    ) -> Self {
        CircuitBreaker {
            store,
            service_name: service_name.into(),
            failure_threshold,
            recovery_timeout,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn is_open(&self) -> Result<bool, BreakerStoreError> {
        self.store.is_circuit_open(&self.service_name).await
    }

    pub async fn record_failure(&self) -> Result<(), BreakerStoreError> {
        // The counter outlives the open flag so that failure history is
        // still visible while the circuit recovers.
        let failures = self
            .store
            .increment_failures(&self.service_name, self.recovery_timeout * 2)
            .await?;
        if failures >= self.failure_threshold {
            warn!(
                service = %self.service_name,
                failures, "circuit breaker OPEN"
            );
            self.store
                .open_circuit(&self.service_name, self.recovery_timeout)
                .await?;
        }
        Ok(())
    }

    pub async fn record_success(&self) -> Result<(), BreakerStoreError> {
        self.store.clear_failures(&self.service_name).await
    }
}
