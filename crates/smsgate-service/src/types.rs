use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generates a time-ordered submission id (UUID v7).
///
/// The id is chosen by the acceptor before the row ever reaches the durable
/// store, so the ingest batcher can bulk insert with conflict-ignore and the
/// dispatch task can reference the submission immediately.
pub fn new_submission_id() -> Uuid {
    Uuid::now_v7()
}

/// Recovers the creation time embedded in a v7 submission id.
///
/// The durable row's `created_at` (the partition key) is derived from the id
/// rather than the insert time, so a re-ingested duplicate maps onto the
/// same primary key and is conflict-ignored.
pub fn submission_created_at(id: &Uuid) -> Option<DateTime<Utc>> {
    let ts = id.get_timestamp()?;
    let (seconds, nanos) = ts.to_unix();
    DateTime::from_timestamp(seconds as i64, nanos)
}

/// Delivery priority. Express costs more and drains through its own queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Express,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Express => "express",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Priority::Normal),
            "express" => Ok(Priority::Express),
            _ => Err(()),
        }
    }
}

/// Submission lifecycle status.
///
/// The status is a closed sum type: rows are parsed into it at the store
/// boundary and only the variant travels through the services.
///
/// Transitions: `pending → queued → sending → {sent | failed}`;
/// `queued → cancelled` until a worker claims the submission; and
/// `failed → queued` while retry budget remains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl SmsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsStatus::Pending => "pending",
            SmsStatus::Queued => "queued",
            SmsStatus::Sending => "sending",
            SmsStatus::Sent => "sent",
            SmsStatus::Failed => "failed",
            SmsStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition to a non-terminal state again
    /// (`failed` may go back to `queued` under an explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SmsStatus::Sent | SmsStatus::Failed | SmsStatus::Cancelled)
    }

    /// Cancellation is only allowed before a worker has started.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SmsStatus::Pending | SmsStatus::Queued)
    }
}

impl fmt::Display for SmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SmsStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SmsStatus::Pending),
            "queued" => Ok(SmsStatus::Queued),
            "sending" => Ok(SmsStatus::Sending),
            "sent" => Ok(SmsStatus::Sent),
            "failed" => Ok(SmsStatus::Failed),
            "cancelled" => Ok(SmsStatus::Cancelled),
            _ => Err(()),
        }
    }
}

/// A submission row as stored in the durable store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    pub recipient: String,
    pub message: String,
    pub status: SmsStatus,
    pub priority: Priority,
    pub cost: Decimal,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_reason: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An accepted submission on its way through the ingest buffer.
///
/// This is the payload the acceptor serializes onto the hot-store list; the
/// batcher turns it into a `queued` row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub id: Uuid,
    pub account_id: Uuid,
    pub recipient: String,
    pub message: String,
    pub priority: Priority,
    pub cost: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A terminal status update emitted by a worker onto the status buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub status: SmsStatus,
    #[serde(default)]
    pub reason: String,
}

impl StatusUpdate {
    pub fn sent(id: Uuid) -> Self {
        StatusUpdate {
            id,
            status: SmsStatus::Sent,
            reason: String::new(),
        }
    }

    pub fn failed(id: Uuid, reason: impl Into<String>) -> Self {
        StatusUpdate {
            id,
            status: SmsStatus::Failed,
            reason: reason.into(),
        }
    }
}

/// A unit of work on a dispatch queue: one accepted, unscheduled submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: Uuid,
    pub priority: Priority,
    /// Number of transport-level attempts already made.
    #[serde(default)]
    pub attempt: u32,
}

impl DispatchTask {
    pub fn new(id: Uuid, priority: Priority) -> Self {
        DispatchTask {
            id,
            priority,
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        DispatchTask {
            id: self.id,
            priority: self.priority,
            attempt: self.attempt + 1,
        }
    }
}

/// Result of a conditional cancellation.
#[derive(Clone, Debug, PartialEq)]
pub enum CancelOutcome {
    /// The row was flipped to `cancelled`; the reserved cost must be
    /// refunded exactly once.
    Cancelled { cost: Decimal },
    /// The row exists but is past the point of cancellation.
    NotCancellable { status: SmsStatus },
    NotFound,
}

/// Kind of an append-only ledger transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Charge,
    Deduct,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Charge => "charge",
            TransactionKind::Deduct => "deduct",
            TransactionKind::Refund => "refund",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(TransactionKind::Charge),
            "deduct" => Ok(TransactionKind::Deduct),
            "refund" => Ok(TransactionKind::Refund),
            _ => Err(()),
        }
    }
}

/// An append-only credit ledger record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-tenant message counts for the statistics endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageStatistics {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
    pub success_rate: f64,
}

impl MessageStatistics {
    pub fn new(total: i64, sent: i64, failed: i64, pending: i64) -> Self {
        let success_rate = if total > 0 {
            ((sent as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        MessageStatistics {
            total,
            sent,
            failed,
            pending,
            success_rate,
        }
    }
}
