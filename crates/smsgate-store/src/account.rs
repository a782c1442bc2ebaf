use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use smsgate_credits::CreditAccount;
use smsgate_service::Account as AccountTrait;
use sqlx::FromRow;
use uuid::Uuid;

/// A tenant account row.
///
/// Only the SHA-256 fingerprint of the API key is stored; the raw key is
/// returned exactly once at provisioning time and never serialized.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct Account {
    pub(crate) id: Uuid,
    pub(crate) username: String,
    #[serde(skip_serializing)]
    pub(crate) api_key_hash: String,
    pub(crate) balance: Decimal,
    pub(crate) total_charged: Decimal,
    pub(crate) total_spent: Decimal,
    pub(crate) rate_limit_per_minute: i32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl AccountTrait for Account {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn rate_limit_per_minute(&self) -> u32 {
        self.rate_limit_per_minute.max(0) as u32
    }
}

impl CreditAccount for Account {
    fn balance(&self) -> Decimal {
        self.balance
    }

    fn total_charged(&self) -> Decimal {
        self.total_charged
    }

    fn total_spent(&self) -> Decimal {
        self.total_spent
    }
}
