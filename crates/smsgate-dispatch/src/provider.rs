use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

/// Failure modes of a provider call.
///
/// A rejection is a definitive answer from the provider and is not retried;
/// a transport error counts against the circuit breaker and goes through the
/// backoff schedule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider rejected: {0}")]
    Rejected(String),
    #[error("provider transport error: {0}")]
    Transport(String),
}

/// The downstream SMS provider capability.
///
/// Exactly one implementation is picked at process start. Real delivery is
/// out of scope here, so the shipped implementation is [`StubProvider`].
#[async_trait]
pub trait SmsProvider {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), ProviderError>;

    async fn healthcheck(&self) -> Result<(), ProviderError>;
}

/// Test double for the provider: succeeds with the configured probability
/// and returns a rejection otherwise.
#[derive(Clone, Debug)]
pub struct StubProvider {
    success_rate: f64,
}

impl StubProvider {
    pub fn new(success_rate: f64) -> Self {
        StubProvider { success_rate }
    }

    /// Always succeeds.
    pub fn reliable() -> Self {
        StubProvider { success_rate: 1.0 }
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        StubProvider { success_rate: 0.95 }
    }
}

#[async_trait]
impl SmsProvider for StubProvider {
    async fn send(&self, _recipient: &str, _message: &str) -> Result<(), ProviderError> {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.success_rate {
            Ok(())
        } else {
            Err(ProviderError::Rejected("invalid number".to_owned()))
        }
    }

    async fn healthcheck(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
