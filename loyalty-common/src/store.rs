//! Durable record of transactions and balances.
//!
//! [`TransactionalStore`] is the capability the message processor is written
//! against; [`PgStore`] implements it on Postgres. Balance mutations only ever
//! happen through [`TransactionalStore::increment_balance`], which is an atomic
//! read-modify-write at the storage layer, so concurrent partitions can update
//! the same user without any locking in the caller.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use thiserror::Error;
use tracing::warn;

use crate::event::Event;

/// Enumeration of errors for operations with a `TransactionalStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The transaction id is already recorded; the event was applied before.
    #[error("transaction {0} was already recorded")]
    DuplicateKey(String),
    #[error("no balance recorded for user {0}")]
    NotFound(String),
    #[error("{command} failed with: {error}")]
    Unavailable {
        command: &'static str,
        #[source]
        error: sqlx::Error,
    },
    #[error("transaction was already closed")]
    TransactionClosed,
    /// The store refused the values themselves, e.g. a balance outside the BIGINT range.
    /// Retrying the same event fails the same way.
    #[error("{command} rejected the data: {message}")]
    InvalidData {
        command: &'static str,
        message: String,
    },
}

// SQLSTATE class 22: data exception
const DATA_EXCEPTION_CLASS: &str = "22";

impl StoreError {
    pub fn unavailable(command: &'static str, error: sqlx::Error) -> Self {
        StoreError::Unavailable { command, error }
    }

    /// Classify a failed statement: data exceptions are permanent, anything else
    /// is treated as the store being unavailable.
    pub fn from_statement(command: &'static str, error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            let data_exception = db_error
                .code()
                .is_some_and(|code| code.starts_with(DATA_EXCEPTION_CLASS));
            if data_exception {
                return StoreError::InvalidData {
                    command,
                    message: db_error.message().to_owned(),
                };
            }
        }
        Self::unavailable(command, error)
    }
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Handle to one open database transaction.
    type Transaction: Send;

    async fn begin_transaction(&self) -> Result<Self::Transaction, StoreError>;

    /// Record the event. Returns `DuplicateKey` if its id is already present.
    async fn insert_transaction(
        &self,
        txn: &mut Self::Transaction,
        event: &Event,
    ) -> Result<(), StoreError>;

    /// Atomically add `delta` to the user's balance, creating the balance if needed.
    async fn increment_balance(
        &self,
        txn: &mut Self::Transaction,
        user_id: &str,
        delta: i64,
    ) -> Result<(), StoreError>;

    async fn commit(&self, txn: &mut Self::Transaction) -> Result<(), StoreError>;

    /// Release the handle without applying it. Safe to call on a handle that was
    /// already committed or rolled back.
    async fn rollback(&self, txn: &mut Self::Transaction);

    /// Read the committed balance outside of any transaction.
    async fn read_balance(&self, user_id: &str) -> Result<i64, StoreError>;
}

/// An open Postgres transaction. `None` once committed or rolled back.
pub struct PgTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn open(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.inner.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a connection pool for the given url.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(|error| StoreError::unavailable("connect", error))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check that a connection can be acquired and used.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::unavailable("ping", error))?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    type Transaction = PgTransaction;

    async fn begin_transaction(&self) -> Result<PgTransaction, StoreError> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::unavailable("begin", error))?;

        Ok(PgTransaction { inner: Some(txn) })
    }

    async fn insert_transaction(
        &self,
        txn: &mut PgTransaction,
        event: &Event,
    ) -> Result<(), StoreError> {
        let txn = txn.open()?;

        let query = r#"
INSERT INTO transactions (id, user_id, amount, created_at)
VALUES ($1, $2, $3, $4)
        "#;

        let result = sqlx::query(query)
            .bind(&event.id)
            .bind(&event.user_id)
            .bind(event.amount)
            .bind(event.created_at)
            .execute(&mut **txn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                Err(StoreError::DuplicateKey(event.id.clone()))
            }
            Err(error) => Err(StoreError::from_statement("insert_transaction", error)),
        }
    }

    async fn increment_balance(
        &self,
        txn: &mut PgTransaction,
        user_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        let txn = txn.open()?;

        let query = r#"
INSERT INTO users (id, balance)
VALUES ($1, $2)
ON CONFLICT (id) DO UPDATE SET balance = users.balance + EXCLUDED.balance
        "#;

        sqlx::query(query)
            .bind(user_id)
            .bind(delta)
            .execute(&mut **txn)
            .await
            .map_err(|error| StoreError::from_statement("increment_balance", error))?;

        Ok(())
    }

    async fn commit(&self, txn: &mut PgTransaction) -> Result<(), StoreError> {
        let open = txn.inner.take().ok_or(StoreError::TransactionClosed)?;

        open.commit()
            .await
            .map_err(|error| StoreError::unavailable("commit", error))
    }

    async fn rollback(&self, txn: &mut PgTransaction) {
        if let Some(open) = txn.inner.take() {
            if let Err(e) = open.rollback().await {
                // The connection drops the transaction server-side when it is returned broken.
                warn!(error = %e, "failed to roll back transaction");
            }
        }
    }

    async fn read_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StoreError::unavailable("read_balance", error))?;

        balance.ok_or_else(|| StoreError::NotFound(user_id.to_owned()))
    }
}
