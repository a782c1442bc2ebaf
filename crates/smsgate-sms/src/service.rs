use smsgate_credits::{BalanceCacheStore, CreditService, LedgerStore};
use smsgate_errors::{ApiError, MessageStoreError};
use smsgate_service::{
    CancelOutcome, MessageStatistics, MessageStore, SmsMessage, SmsStatus,
};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("message not found")]
    NotFound,
    #[error("cannot cancel message in status {0}")]
    NotCancellable(SmsStatus),
    #[error(transparent)]
    Store(#[from] MessageStoreError),
    #[error(transparent)]
    Credit(#[from] smsgate_credits::CreditError),
}

impl From<CancelError> for ApiError {
    fn from(src: CancelError) -> Self {
        match src {
            CancelError::NotFound => ApiError::message_not_found(),
            CancelError::NotCancellable(status) => {
                ApiError::conflict(format!("Cannot cancel message in status {}", status))
            }
            CancelError::Store(err) => err.into(),
            CancelError::Credit(err) => err.into(),
        }
    }
}

/// Tenant-facing message queries and cancellation.
#[derive(Clone)]
pub struct SmsService<M, H, D> {
    messages: M,
    credits: CreditService<H, D>,
}

impl<M, H, D> SmsService<M, H, D>
where
    M: MessageStore + Clone + Send + Sync + 'static,
    H: BalanceCacheStore + Clone + Send + Sync + 'static,
    D: LedgerStore + Clone + Send + Sync + 'static,
{
    pub fn new(messages: M, credits: CreditService<H, D>) -> Self {
        SmsService { messages, credits }
    }

    pub async fn get_message(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SmsMessage>, MessageStoreError> {
        self.messages.load_message_for_account(account_id, id).await
    }

    pub async fn list_messages(
        &self,
        account_id: Uuid,
        status: Option<SmsStatus>,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<SmsMessage>, MessageStoreError> {
        self.messages
            .list_messages(account_id, status, before, limit)
            .await
    }

    pub async fn statistics(
        &self,
        account_id: Uuid,
    ) -> Result<MessageStatistics, MessageStoreError> {
        self.messages.statistics(account_id).await
    }

    /// Cancels a submission that no worker has claimed yet.
    ///
    /// The store performs the status check and the flip as one conditional
    /// update, so exactly one caller observes `Cancelled` and refunds the
    /// reserved cost. The refund goes back to the working balance and
    /// drains the pending accumulator; a racing worker's buffered outcome
    /// is dropped by the write-back's terminal-status rule.
    pub async fn cancel_message(&self, account_id: Uuid, id: Uuid) -> Result<(), CancelError> {
        match self.messages.cancel_message(account_id, id).await? {
            CancelOutcome::Cancelled { cost } => {
                if let Err(err) = self
                    .credits
                    .refund_cancellation(account_id, cost, &id.to_string())
                    .await
                {
                    // The row is already cancelled; a lost refund must be
                    // loud enough for reconciliation.
                    error!(
                        %account_id,
                        %id, critical = true, "cancelled without refund: {}", err
                    );
                    return Err(err.into());
                }
                info!(%account_id, %id, %cost, "submission cancelled and refunded");
                Ok(())
            }
            CancelOutcome::NotCancellable { status } => Err(CancelError::NotCancellable(status)),
            CancelOutcome::NotFound => Err(CancelError::NotFound),
        }
    }
}
