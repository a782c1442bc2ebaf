//! # smsgate-api
//!
//! The HTTP surface of the gateway, exposed as a Warp filter. Tenants
//! authenticate with `X-Api-Key` (the server stores only the SHA-256
//! fingerprint) and pass through a sliding-window rate limit before any
//! handler runs. Errors are rendered as RFC7807 problem documents by the
//! shared rejection handler.
//!
//! Routes:
//!
//! - `POST /api/sms/send` - submit (202; optional `X-Request-ID` idempotency)
//! - `GET  /api/sms/messages` - list with keyset pagination
//! - `GET  /api/sms/messages/{id}` - detail
//! - `POST /api/sms/messages/{id}/cancel` - cancel + refund
//! - `GET  /api/sms/statistics` - per-tenant counts
//! - `GET  /api/credits/balance` - working balance and lifetime totals
//! - `POST /api/credits/charge` - add prepaid credit
//! - `GET  /api/credits/transactions` - ledger listing
//! - `GET  /health` - unauthenticated liveness of both stores

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smsgate_credits::{BalanceCacheStore, CreditAccount, CreditService, LedgerStore};
use smsgate_errors::{default_rejection_handler, ApiError};
use smsgate_service::{
    api_key_fingerprint, Account, AccountStore, HealthCheckStore, LedgerTransaction,
    MessageStore, RateLimitStore, SmsMessage, SmsStatus,
};
use smsgate_sms::{
    AcceptorConfig, IdempotencyStore, IngestBufferStore, SmsAcceptor, SmsService, SubmitRequest,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;
const DEFAULT_TRANSACTION_LIMIT: u32 = 100;

/// Everything the HTTP handlers need, cloned into each route.
///
/// `S` is the hot store and `T` the durable store; in production these are
/// the Redis and Postgres stores, in tests in-memory stand-ins.
#[derive(Clone)]
pub struct SmsGatewayApi<S, T>
where
    T: AccountStore,
{
    hot: S,
    durable: T,
    acceptor: SmsAcceptor<S, S, T>,
    sms: SmsService<T, S, T>,
    credits: CreditService<S, T>,
}

impl<S, T> SmsGatewayApi<S, T>
where
    S: IdempotencyStore
        + IngestBufferStore
        + BalanceCacheStore
        + RateLimitStore
        + HealthCheckStore
        + Clone
        + Send
        + Sync
        + 'static,
    T: AccountStore
        + LedgerStore
        + MessageStore
        + HealthCheckStore
        + Clone
        + Send
        + Sync
        + 'static,
    T::Account: CreditAccount + Serialize + Sync,
{
    pub fn new(
        hot: S,
        durable: T,
        acceptor_config: AcceptorConfig,
        ingest_nudge: Arc<Notify>,
    ) -> Self {
        let credits = CreditService::new(hot.clone(), durable.clone());
        let acceptor = SmsAcceptor::new(
            hot.clone(),
            credits.clone(),
            acceptor_config,
            ingest_nudge,
        );
        let sms = SmsService::new(durable.clone(), credits.clone());
        SmsGatewayApi {
            hot,
            durable,
            acceptor,
            sms,
            credits,
        }
    }

    async fn authenticate(&self, api_key: Option<String>) -> Result<T::Account, Rejection> {
        let raw_key = match api_key {
            Some(raw_key) if !raw_key.is_empty() => raw_key,
            _ => return Err(ApiError::unauthorized().into()),
        };
        let account = self
            .durable
            .get_account_by_api_key(&api_key_fingerprint(&raw_key))
            .await
            .map_err(|err| {
                debug!("authentication failed: {}", err);
                Rejection::from(ApiError::unauthorized())
            })?;

        let limit = account.rate_limit_per_minute();
        if self
            .hot
            .is_rate_limited(account.id(), limit)
            .await
            .map_err(ApiError::from)?
        {
            return Err(ApiError::rate_limited(limit).into());
        }
        Ok(account)
    }

    async fn handle_send(
        &self,
        account: T::Account,
        request_id: Option<String>,
        body: SendBody,
    ) -> Result<impl Reply, Rejection> {
        let accepted = self
            .acceptor
            .submit(
                &account,
                SubmitRequest {
                    recipient: body.recipient,
                    message: body.message,
                    priority: body.priority.unwrap_or_default(),
                    scheduled_at: body.scheduled_at,
                    request_id,
                },
            )
            .await
            .map_err(ApiError::from)?;

        Ok(warp::reply::with_status(
            warp::reply::json(&SendResponse {
                success: true,
                message: "SMS queued successfully",
                sms_id: accepted.id,
                cost: accepted.cost,
                status: accepted.status,
            }),
            StatusCode::ACCEPTED,
        ))
    }

    async fn handle_list(
        &self,
        account: T::Account,
        params: ListParams,
    ) -> Result<impl Reply, Rejection> {
        let status = params
            .status
            .as_deref()
            .map(|raw| {
                SmsStatus::from_str(raw).map_err(|_| {
                    Rejection::from(ApiError::invalid_input(format!(
                        "unknown status filter {:?}",
                        raw
                    )))
                })
            })
            .transpose()?;
        let limit = params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let results = self
            .sms
            .list_messages(account.id(), status, params.before, limit)
            .await
            .map_err(ApiError::from)?;

        let next = if results.len() as u32 == limit {
            results.last().map(|last| {
                let mut next = format!("/api/sms/messages?limit={}&before={}", limit, last.id);
                if let Some(status) = &params.status {
                    next.push_str(&format!("&status={}", status));
                }
                next
            })
        } else {
            None
        };

        Ok(warp::reply::json(&ListResponse {
            next,
            previous: None,
            results,
        }))
    }

    async fn handle_detail(
        &self,
        account: T::Account,
        id: Uuid,
    ) -> Result<impl Reply, Rejection> {
        let message = self
            .sms
            .get_message(account.id(), id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| Rejection::from(ApiError::message_not_found()))?;
        Ok(warp::reply::json(&message))
    }

    async fn handle_cancel(
        &self,
        account: T::Account,
        id: Uuid,
    ) -> Result<impl Reply, Rejection> {
        self.sms
            .cancel_message(account.id(), id)
            .await
            .map_err(ApiError::from)?;
        Ok(warp::reply::json(&CancelResponse {
            success: true,
            message: "SMS cancelled successfully",
            sms_id: id,
            status: SmsStatus::Cancelled,
        }))
    }

    async fn handle_statistics(&self, account: T::Account) -> Result<impl Reply, Rejection> {
        let stats = self
            .sms
            .statistics(account.id())
            .await
            .map_err(ApiError::from)?;
        Ok(warp::reply::json(&stats))
    }

    async fn handle_balance(&self, account: T::Account) -> Result<impl Reply, Rejection> {
        // Working balance from the hot side; lifetime totals from the row
        // loaded at authentication time.
        let balance = self
            .credits
            .get_balance(account.id())
            .await
            .map_err(ApiError::from)?;
        Ok(warp::reply::json(&BalanceResponse {
            balance,
            total_charged: account.total_charged(),
            total_spent: account.total_spent(),
            rate_limit_per_minute: account.rate_limit_per_minute(),
        }))
    }

    async fn handle_charge(
        &self,
        account: T::Account,
        body: ChargeBody,
    ) -> Result<impl Reply, Rejection> {
        let balance = self
            .credits
            .charge(
                account.id(),
                body.amount,
                body.description.as_deref().unwrap_or(""),
            )
            .await
            .map_err(ApiError::from)?;
        Ok(warp::reply::json(&ChargeResponse {
            success: true,
            balance,
        }))
    }

    async fn handle_transactions(
        &self,
        account: T::Account,
        params: TransactionParams,
    ) -> Result<impl Reply, Rejection> {
        let limit = params
            .limit
            .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
            .clamp(1, MAX_PAGE_SIZE);
        let results = self
            .credits
            .get_transactions(account.id(), limit)
            .await
            .map_err(ApiError::from)?;
        Ok(warp::reply::json(&TransactionsResponse {
            count: results.len(),
            results,
        }))
    }

    async fn handle_health(&self) -> Result<impl Reply, Rejection> {
        let hot_store = self.hot.is_healthy().await;
        let durable_store = self.durable.is_healthy().await;
        let healthy = hot_store && durable_store;
        let response = warp::reply::json(&HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            components: HealthComponents {
                hot_store: up_or_down(hot_store),
                durable_store: up_or_down(durable_store),
            },
        });
        Ok(warp::reply::with_status(
            response,
            if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            },
        ))
    }
}

fn up_or_down(healthy: bool) -> &'static str {
    if healthy {
        "up"
    } else {
        "down"
    }
}

/// Builds the full route tree with authentication, rate limiting and the
/// RFC7807 rejection handler applied.
pub fn api_filter<S, T>(api: SmsGatewayApi<S, T>) -> BoxedFilter<(impl Reply,)>
where
    S: IdempotencyStore
        + IngestBufferStore
        + BalanceCacheStore
        + RateLimitStore
        + HealthCheckStore
        + Clone
        + Send
        + Sync
        + 'static,
    T: AccountStore
        + LedgerStore
        + MessageStore
        + HealthCheckStore
        + Clone
        + Send
        + Sync
        + 'static,
    T::Account: CreditAccount + Serialize + Sync,
{
    let with_api = {
        let api = api.clone();
        warp::any().map(move || api.clone())
    };

    let authenticated = warp::header::optional::<String>("x-api-key")
        .and(with_api.clone())
        .and_then(
            |api_key: Option<String>, api: SmsGatewayApi<S, T>| async move {
                api.authenticate(api_key).await
            },
        );

    // POST /api/sms/send
    let send = warp::post()
        .and(warp::path!("api" / "sms" / "send"))
        .and(authenticated.clone())
        .and(warp::header::optional::<String>("x-request-id"))
        .and(warp::body::json())
        .and(with_api.clone())
        .and_then(
            |account, request_id: Option<String>, body: SendBody, api: SmsGatewayApi<S, T>| async move {
                api.handle_send(account, request_id, body).await
            },
        );

    // GET /api/sms/messages
    let list = warp::get()
        .and(warp::path!("api" / "sms" / "messages"))
        .and(authenticated.clone())
        .and(warp::query::<ListParams>())
        .and(with_api.clone())
        .and_then(|account, params: ListParams, api: SmsGatewayApi<S, T>| async move {
            api.handle_list(account, params).await
        });

    // GET /api/sms/messages/:id
    let detail = warp::get()
        .and(warp::path!("api" / "sms" / "messages" / Uuid))
        .and(authenticated.clone())
        .and(with_api.clone())
        .and_then(|id, account, api: SmsGatewayApi<S, T>| async move {
            api.handle_detail(account, id).await
        });

    // POST /api/sms/messages/:id/cancel
    let cancel = warp::post()
        .and(warp::path!("api" / "sms" / "messages" / Uuid / "cancel"))
        .and(authenticated.clone())
        .and(with_api.clone())
        .and_then(|id, account, api: SmsGatewayApi<S, T>| async move {
            api.handle_cancel(account, id).await
        });

    // GET /api/sms/statistics
    let statistics = warp::get()
        .and(warp::path!("api" / "sms" / "statistics"))
        .and(authenticated.clone())
        .and(with_api.clone())
        .and_then(|account, api: SmsGatewayApi<S, T>| async move {
            api.handle_statistics(account).await
        });

    // GET /api/credits/balance
    let balance = warp::get()
        .and(warp::path!("api" / "credits" / "balance"))
        .and(authenticated.clone())
        .and(with_api.clone())
        .and_then(|account, api: SmsGatewayApi<S, T>| async move {
            api.handle_balance(account).await
        });

    // POST /api/credits/charge
    let charge = warp::post()
        .and(warp::path!("api" / "credits" / "charge"))
        .and(authenticated.clone())
        .and(warp::body::json())
        .and(with_api.clone())
        .and_then(|account, body: ChargeBody, api: SmsGatewayApi<S, T>| async move {
            api.handle_charge(account, body).await
        });

    // GET /api/credits/transactions
    let transactions = warp::get()
        .and(warp::path!("api" / "credits" / "transactions"))
        .and(authenticated)
        .and(warp::query::<TransactionParams>())
        .and(with_api.clone())
        .and_then(|account, params: TransactionParams, api: SmsGatewayApi<S, T>| async move {
            api.handle_transactions(account, params).await
        });

    // GET /health (no auth)
    let health = warp::get()
        .and(warp::path!("health"))
        .and(with_api)
        .and_then(|api: SmsGatewayApi<S, T>| async move { api.handle_health().await });

    send.or(list)
        .or(detail)
        .or(cancel)
        .or(statistics)
        .or(balance)
        .or(charge)
        .or(transactions)
        .or(health)
        .recover(default_rejection_handler)
        .boxed()
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub priority: Option<smsgate_service::Priority>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SendResponse {
    success: bool,
    message: &'static str,
    sms_id: Uuid,
    cost: Decimal,
    status: SmsStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub before: Option<Uuid>,
}

#[derive(Serialize)]
struct ListResponse {
    next: Option<String>,
    previous: Option<String>,
    results: Vec<SmsMessage>,
}

#[derive(Serialize)]
struct CancelResponse {
    success: bool,
    message: &'static str,
    sms_id: Uuid,
    status: SmsStatus,
}

#[derive(Serialize)]
struct BalanceResponse {
    balance: Decimal,
    total_charged: Decimal,
    total_spent: Decimal,
    rate_limit_per_minute: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize)]
struct ChargeResponse {
    success: bool,
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransactionParams {
    pub limit: Option<u32>,
}

#[derive(Serialize)]
struct TransactionsResponse {
    count: usize,
    results: Vec<LedgerTransaction>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    components: HealthComponents,
}

#[derive(Serialize)]
struct HealthComponents {
    hot_store: &'static str,
    durable_store: &'static str,
}

#[cfg(test)]
mod tests;
