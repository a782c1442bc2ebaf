//! # smsgate-store
//!
//! The two backends of the gateway:
//!
//! - [`RedisStore`] - the hot store. Atomic Lua scripts for balance
//!   reservation and refunds, lists for the ingest/status buffers and the
//!   dispatch queues, a sorted set for delayed retries, plain keys with TTLs
//!   for idempotency markers, circuit breaker state, advisory job locks and
//!   per-account balance locks.
//! - [`PgStore`] - the durable store. Accounts, the append-only credit
//!   ledger, and the `sms_messages` table range-partitioned by creation
//!   time, with bulk `UNNEST` inserts and guarded bulk status updates.

mod account;
mod postgres;
mod redis_store;

pub use account::Account;
pub use postgres::PgStore;
pub use redis_store::{RedisStore, RedisStoreBuilder};
