use crate::{IdempotencyStore, IngestBufferStore, SubmitError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use smsgate_credits::{BalanceCacheStore, CreditError, CreditService, LedgerStore};
use smsgate_service::{new_submission_id, Account, NewSubmission, Priority, SmsStatus};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error};
use uuid::Uuid;

/// Admission-path configuration.
#[derive(Clone, Debug)]
pub struct AcceptorConfig {
    /// Cost of a normal-priority message.
    pub base_cost: Decimal,
    /// Multiplier applied for express priority.
    pub express_multiplier: Decimal,
    /// Buffer length at which the acceptor nudges the ingest batcher to run
    /// ahead of its tick.
    pub ingest_high_water: usize,
}

/// A submission as it arrives from the HTTP surface.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub recipient: String,
    pub message: String,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Client-supplied request id; generated server-side when absent (no
    /// idempotency benefit then, but no extra failure mode either).
    pub request_id: Option<String>,
}

/// Result of a successful admission (HTTP 202).
#[derive(Clone, Debug, PartialEq)]
pub struct Accepted {
    pub id: Uuid,
    pub cost: Decimal,
    pub status: SmsStatus,
}

/// The submission acceptor.
///
/// Runs on request-handler tasks and makes at most three hot-store round
/// trips (idempotency marker, reservation script, buffer push); the durable
/// store is never touched here. Each gate fails closed: a failure after the
/// idempotency marker was claimed releases the marker so the caller can
/// retry.
#[derive(Clone)]
pub struct SmsAcceptor<S, H, D> {
    store: S,
    credits: CreditService<H, D>,
    config: AcceptorConfig,
    ingest_nudge: Arc<Notify>,
}

impl<S, H, D> SmsAcceptor<S, H, D>
where
    S: IdempotencyStore + IngestBufferStore + Clone + Send + Sync + 'static,
    H: BalanceCacheStore + Clone + Send + Sync + 'static,
    D: LedgerStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        credits: CreditService<H, D>,
        config: AcceptorConfig,
        ingest_nudge: Arc<Notify>,
    ) -> Self {
        SmsAcceptor {
            store,
            credits,
            config,
            ingest_nudge,
        }
    }

    pub fn message_cost(&self, priority: Priority) -> Decimal {
        match priority {
            Priority::Express => self.config.base_cost * self.config.express_multiplier,
            Priority::Normal => self.config.base_cost,
        }
    }

    pub async fn submit<A: Account>(
        &self,
        account: &A,
        request: SubmitRequest,
    ) -> Result<Accepted, SubmitError> {
        let account_id = account.id();
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        if !self.store.claim_request_id(account_id, &request_id).await? {
            return Err(SubmitError::DuplicateRequest);
        }

        match self.admit(account_id, request).await {
            Ok(accepted) => Ok(accepted),
            Err(err) => {
                // Fail closed but leave the request retryable.
                if let Err(release_err) = self
                    .store
                    .release_request_id(account_id, &request_id)
                    .await
                {
                    error!(
                        %account_id,
                        request_id, "failed to release idempotency marker: {}", release_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn admit(
        &self,
        account_id: Uuid,
        request: SubmitRequest,
    ) -> Result<Accepted, SubmitError> {
        let recipient = validate_recipient(&request.recipient)?;
        validate_message(&request.message)?;
        let cost = self.message_cost(request.priority);

        match self.credits.reserve(account_id, cost).await {
            Ok(()) => {}
            Err(CreditError::InsufficientBalance) => {
                return Err(SubmitError::InsufficientBalance)
            }
            Err(err) => return Err(SubmitError::Credit(err)),
        }

        let id = new_submission_id();
        let submission = NewSubmission {
            id,
            account_id,
            recipient,
            message: request.message,
            priority: request.priority,
            cost,
            scheduled_at: request.scheduled_at,
        };

        let buffered = match self.store.push_submission(&submission).await {
            Ok(length) => length,
            Err(err) => {
                // The reservation is already in place; give the credit back
                // so the failed admission does not settle.
                if let Err(refund_err) = self
                    .credits
                    .refund_cancellation(account_id, cost, &id.to_string())
                    .await
                {
                    error!(
                        %account_id,
                        %id, "failed to refund reservation of unbuffered submission: {}", refund_err
                    );
                }
                return Err(err.into());
            }
        };

        if buffered >= self.config.ingest_high_water {
            self.ingest_nudge.notify_one();
        }

        debug!(
            %id,
            %account_id,
            recipient = %submission.recipient,
            %cost,
            priority = %submission.priority,
            "submission accepted"
        );

        Ok(Accepted {
            id,
            cost,
            status: SmsStatus::Queued,
        })
    }
}

/// Strips spaces and hyphens, then requires 11 digits starting with `09`.
pub fn validate_recipient(raw: &str) -> Result<String, SubmitError> {
    let phone: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();

    if !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(SubmitError::InvalidInput(
            "Phone number must contain only digits".to_owned(),
        ));
    }
    if phone.len() != 11 || !phone.starts_with("09") {
        return Err(SubmitError::InvalidInput(
            "Invalid phone number format. Must be 11 digits starting with 09".to_owned(),
        ));
    }
    Ok(phone)
}

fn validate_message(message: &str) -> Result<(), SubmitError> {
    if message.is_empty() {
        return Err(SubmitError::InvalidInput(
            "Message cannot be empty".to_owned(),
        ));
    }
    if message.chars().count() > 1000 {
        return Err(SubmitError::InvalidInput(
            "Message too long. Maximum 1000 characters".to_owned(),
        ));
    }
    Ok(())
}
