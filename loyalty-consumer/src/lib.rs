//! Loyalty balance consumer.
//!
//! Consumes transaction events from Kafka, applies each one to the user's
//! balance in Postgres inside a single transaction, and refreshes a Redis copy
//! of the balance after commit. Offsets are committed only once an event has
//! been committed or permanently rejected, which gives at-least-once delivery
//! with idempotency enforced by the transaction id.
//!
//! When logging errors with a cause chain, prefer `{e:#}` or `error = ?e` so the
//! root cause stays visible.

pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod processor;
pub mod refresh;
pub mod shutdown;
