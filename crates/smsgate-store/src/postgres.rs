use crate::account::Account;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use secrecy::SecretString;
use smsgate_credits::LedgerStore;
use smsgate_errors::{AccountStoreError, LedgerStoreError, MessageStoreError};
use smsgate_service::{
    api_key_fingerprint, submission_created_at, AccountStore, CancelOutcome, HealthCheckStore,
    LedgerTransaction, MessageStatistics, MessageStore, NewSubmission, PartitionStore, Priority,
    SmsMessage, SmsStatus, TransactionKind,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use std::convert::TryFrom;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_MAX_CONNECTIONS: u32 = 16;
const API_KEY_LENGTH: usize = 48;

/// The durable store.
///
/// Settled truth: accounts, the append-only credit ledger, and the
/// partitioned messages table. All monetary updates run in row-locked
/// transactions; message status updates carry the terminal-status guards in
/// their WHERE clauses.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and applies the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| sqlx::Error::Migrate(Box::new(err)))?;
        debug!("connected to postgres and ran migrations");
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

#[async_trait]
impl AccountStore for PgStore {
    type Account = Account;

    async fn get_account(&self, account_id: Uuid) -> Result<Account, AccountStoreError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        account.ok_or_else(|| AccountStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn get_account_by_api_key(
        &self,
        api_key_hash: &str,
    ) -> Result<Account, AccountStoreError> {
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE api_key_hash = $1")
                .bind(api_key_hash)
                .fetch_optional(&self.pool)
                .await?;
        account.ok_or_else(|| AccountStoreError::AccountNotFound("api key".to_owned()))
    }

    async fn insert_account(
        &self,
        username: &str,
        rate_limit_per_minute: u32,
    ) -> Result<(Account, SecretString), AccountStoreError> {
        let raw_key = generate_api_key();
        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, username, api_key_hash, rate_limit_per_minute)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(username)
        .bind(api_key_fingerprint(&raw_key))
        .bind(rate_limit_per_minute as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                AccountStoreError::DuplicateUsername(username.to_owned())
            }
            _ => AccountStoreError::from(err),
        })?;

        info!(id = %account.id, username, "provisioned account");
        Ok((account, SecretString::new(raw_key)))
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn load_balance(&self, account_id: Uuid) -> Result<Decimal, LedgerStoreError> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        balance.ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))
    }

    async fn charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<Decimal, LedgerStoreError> {
        let mut tx = self.pool.begin().await?;
        let before: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;
        let before =
            before.ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))?;
        let after = before + amount;

        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $2, total_charged = total_charged + $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        insert_transaction(
            &mut tx,
            account_id,
            TransactionKind::Charge,
            amount,
            before,
            after,
            description,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(after)
    }

    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<(), LedgerStoreError> {
        let mut tx = self.pool.begin().await?;
        let before: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;
        let before =
            before.ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))?;
        let after = before - amount;

        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - $2, total_spent = total_spent + $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        // Deductions are written in aggregate, one row per sweep.
        insert_transaction(
            &mut tx,
            account_id,
            TransactionKind::Deduct,
            amount,
            before,
            after,
            "settlement sweep",
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_refund(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<(), LedgerStoreError> {
        let mut tx = self.pool.begin().await?;
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;
        let balance =
            balance.ok_or_else(|| LedgerStoreError::AccountNotFound(account_id.to_string()))?;

        // The settled balance is untouched: the refunded reservation never
        // settled, so before == after on the ledger row.
        insert_transaction(
            &mut tx,
            account_id,
            TransactionKind::Refund,
            amount,
            balance,
            balance,
            "cancellation refund",
            Some(reference_id),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_transactions(
        &self,
        account_id: Uuid,
        limit: u32,
    ) -> Result<Vec<LedgerTransaction>, LedgerStoreError> {
        let rows = sqlx::query_as::<_, DbTransaction>(
            r#"
            SELECT id, account_id, kind, amount, balance_before, balance_after,
                   description, reference_id, created_at
            FROM credit_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerTransaction::try_from).collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
    kind: TransactionKind,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    description: &str,
    reference_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO credit_transactions
            (account_id, kind, amount, balance_before, balance_after, description, reference_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(account_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(balance_before)
    .bind(balance_after)
    .bind(description)
    .bind(reference_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Database row for the credit ledger; the kind string parses into the
/// closed sum type at this boundary.
#[derive(FromRow)]
struct DbTransaction {
    id: i64,
    account_id: Uuid,
    kind: String,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    description: String,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbTransaction> for LedgerTransaction {
    type Error = LedgerStoreError;

    fn try_from(db: DbTransaction) -> Result<Self, Self::Error> {
        let kind = TransactionKind::from_str(&db.kind).map_err(|_| {
            LedgerStoreError::Other(Box::new(sqlx::Error::Decode(
                format!("unknown transaction kind {:?}", db.kind).into(),
            )))
        })?;
        Ok(LedgerTransaction {
            id: db.id,
            account_id: db.account_id,
            kind,
            amount: db.amount,
            balance_before: db.balance_before,
            balance_after: db.balance_after,
            description: db.description,
            reference_id: db.reference_id,
            created_at: db.created_at,
        })
    }
}

/// Database row for a submission.
#[derive(FromRow)]
struct DbMessage {
    id: Uuid,
    account_id: Uuid,
    recipient: String,
    message: String,
    status: String,
    priority: String,
    cost: Decimal,
    scheduled_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    failed_reason: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbMessage> for SmsMessage {
    type Error = MessageStoreError;

    fn try_from(db: DbMessage) -> Result<Self, Self::Error> {
        let status = SmsStatus::from_str(&db.status).map_err(|_| decode_error("status", &db.status))?;
        let priority =
            Priority::from_str(&db.priority).map_err(|_| decode_error("priority", &db.priority))?;
        Ok(SmsMessage {
            id: db.id,
            account_id: db.account_id,
            recipient: db.recipient,
            message: db.message,
            status,
            priority,
            cost: db.cost,
            scheduled_at: db.scheduled_at,
            sent_at: db.sent_at,
            failed_reason: db.failed_reason,
            retry_count: db.retry_count,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

fn decode_error(field: &str, value: &str) -> MessageStoreError {
    MessageStoreError::Other(Box::new(sqlx::Error::Decode(
        format!("unknown {} {:?}", field, value).into(),
    )))
}

const MESSAGE_COLUMNS: &str = "id, account_id, recipient, message, status, priority, cost, \
                               scheduled_at, sent_at, failed_reason, retry_count, created_at, updated_at";

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_submissions(
        &self,
        submissions: &[NewSubmission],
    ) -> Result<u64, MessageStoreError> {
        if submissions.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(submissions.len());
        let mut account_ids = Vec::with_capacity(submissions.len());
        let mut recipients = Vec::with_capacity(submissions.len());
        let mut messages = Vec::with_capacity(submissions.len());
        let mut priorities = Vec::with_capacity(submissions.len());
        let mut costs = Vec::with_capacity(submissions.len());
        let mut scheduled = Vec::with_capacity(submissions.len());
        let mut created = Vec::with_capacity(submissions.len());
        for submission in submissions {
            ids.push(submission.id);
            account_ids.push(submission.account_id);
            recipients.push(submission.recipient.clone());
            messages.push(submission.message.clone());
            priorities.push(submission.priority.as_str().to_owned());
            costs.push(submission.cost);
            scheduled.push(submission.scheduled_at);
            // Deriving created_at from the id makes a re-ingested duplicate
            // collide on the primary key instead of inserting a second row.
            created.push(submission_created_at(&submission.id).unwrap_or_else(Utc::now));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO sms_messages
                (id, account_id, recipient, message, status, priority, cost,
                 scheduled_at, failed_reason, retry_count, created_at, updated_at)
            SELECT t.id, t.account_id, t.recipient, t.message, 'queued', t.priority, t.cost,
                   t.scheduled_at, '', 0, t.created_at, now()
            FROM UNNEST($1::uuid[], $2::uuid[], $3::varchar[], $4::text[], $5::varchar[],
                        $6::numeric[], $7::timestamptz[], $8::timestamptz[])
                 AS t(id, account_id, recipient, message, priority, cost, scheduled_at, created_at)
            ON CONFLICT (id, created_at) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&account_ids)
        .bind(&recipients)
        .bind(&messages)
        .bind(&priorities)
        .bind(&costs)
        .bind(&scheduled)
        .bind(&created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn load_message(&self, id: Uuid) -> Result<Option<SmsMessage>, MessageStoreError> {
        let row = sqlx::query_as::<_, DbMessage>(&format!(
            "SELECT {} FROM sms_messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SmsMessage::try_from).transpose()
    }

    async fn load_message_for_account(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SmsMessage>, MessageStoreError> {
        let row = sqlx::query_as::<_, DbMessage>(&format!(
            "SELECT {} FROM sms_messages WHERE id = $1 AND account_id = $2",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SmsMessage::try_from).transpose()
    }

    async fn list_messages(
        &self,
        account_id: Uuid,
        status: Option<SmsStatus>,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<SmsMessage>, MessageStoreError> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {} FROM sms_messages WHERE account_id = ",
            MESSAGE_COLUMNS
        ));
        builder.push_bind(account_id);
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(before) = before {
            builder.push(" AND id < ");
            builder.push_bind(before);
        }
        builder.push(" ORDER BY id DESC LIMIT ");
        builder.push_bind(limit as i64);

        let rows: Vec<DbMessage> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(SmsMessage::try_from).collect()
    }

    async fn apply_status_updates(
        &self,
        sent: &[Uuid],
        failed: &[(Uuid, String)],
    ) -> Result<u64, MessageStoreError> {
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;

        if !sent.is_empty() {
            let result = sqlx::query(
                r#"
                UPDATE sms_messages
                SET status = 'sent', sent_at = now(), updated_at = now()
                WHERE id = ANY($1) AND status NOT IN ('cancelled', 'sent')
                "#,
            )
            .bind(sent)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        if !failed.is_empty() {
            let (ids, reasons): (Vec<Uuid>, Vec<String>) = failed.iter().cloned().unzip();
            let result = sqlx::query(
                r#"
                UPDATE sms_messages AS m
                SET status = 'failed', failed_reason = u.reason,
                    retry_count = m.retry_count + 1, updated_at = now()
                FROM (SELECT UNNEST($1::uuid[]) AS id, UNNEST($2::text[]) AS reason) AS u
                WHERE m.id = u.id AND m.status NOT IN ('cancelled', 'sent')
                "#,
            )
            .bind(&ids)
            .bind(&reasons)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn cancel_message(
        &self,
        account_id: Uuid,
        id: Uuid,
    ) -> Result<CancelOutcome, MessageStoreError> {
        // Single conditional update: the status check and the flip are one
        // statement, so only one of two racing cancels gets the cost back.
        let cancelled: Option<Decimal> = sqlx::query_scalar(
            r#"
            UPDATE sms_messages
            SET status = 'cancelled', updated_at = now()
            WHERE id = $1 AND account_id = $2 AND status IN ('pending', 'queued')
            RETURNING cost
            "#,
        )
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(cost) = cancelled {
            return Ok(CancelOutcome::Cancelled { cost });
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM sms_messages WHERE id = $1 AND account_id = $2",
        )
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        match status {
            Some(raw) => {
                let status =
                    SmsStatus::from_str(&raw).map_err(|_| decode_error("status", &raw))?;
                Ok(CancelOutcome::NotCancellable { status })
            }
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn statistics(&self, account_id: Uuid) -> Result<MessageStatistics, MessageStoreError> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS total,
                   count(*) FILTER (WHERE status = 'sent') AS sent,
                   count(*) FILTER (WHERE status = 'failed') AS failed,
                   count(*) FILTER (WHERE status IN ('pending', 'queued')) AS pending
            FROM sms_messages
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageStatistics::new(
            row.try_get::<i64, _>("total")?,
            row.try_get::<i64, _>("sent")?,
            row.try_get::<i64, _>("failed")?,
            row.try_get::<i64, _>("pending")?,
        ))
    }

    async fn claim_due_scheduled(
        &self,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        // Clearing the schedule mark in the same statement hands each row
        // out exactly once; the partial index covers the inner scan.
        let rows = sqlx::query(
            r#"
            UPDATE sms_messages
            SET scheduled_at = NULL, updated_at = now()
            WHERE (id, created_at) IN (
                SELECT id, created_at FROM sms_messages
                WHERE status = 'queued' AND scheduled_at IS NOT NULL AND scheduled_at <= now()
                LIMIT $1
            )
            RETURNING id, priority
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        parse_dispatch_rows(rows)
    }

    async fn requeue_failed(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE sms_messages
            SET status = 'queued', updated_at = now()
            WHERE (id, created_at) IN (
                SELECT id, created_at FROM sms_messages
                WHERE status = 'failed' AND retry_count < $1
                LIMIT $2
            )
            RETURNING id, priority
            "#,
        )
        .bind(max_retries)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        parse_dispatch_rows(rows)
    }
}

fn parse_dispatch_rows(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<(Uuid, Priority)>, MessageStoreError> {
    rows.into_iter()
        .map(|row| {
            let id: Uuid = row.try_get("id")?;
            let priority_raw: String = row.try_get("priority")?;
            let priority = Priority::from_str(&priority_raw)
                .map_err(|_| decode_error("priority", &priority_raw))?;
            Ok((id, priority))
        })
        .collect()
}

#[async_trait]
impl PartitionStore for PgStore {
    async fn ensure_year_partition(&self, year: i32) -> Result<Option<String>, MessageStoreError> {
        let partition = format!("sms_messages_y{}", year);
        let exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = $1
            "#,
        )
        .bind(&partition)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_some() {
            return Ok(None);
        }

        info!(partition = %partition, year, "creating yearly partition");
        // Identifiers cannot be bound; the name is built from an integer.
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {partition} PARTITION OF sms_messages \
             FOR VALUES FROM ('{year}-01-01 00:00:00+00') TO ('{next}-01-01 00:00:00+00')",
            partition = partition,
            year = year,
            next = year + 1,
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {partition}_created_at_idx ON {partition} (created_at)",
            partition = partition,
        ))
        .execute(&self.pool)
        .await?;
        Ok(Some(partition))
    }
}

#[async_trait]
impl HealthCheckStore for PgStore {
    async fn is_healthy(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
