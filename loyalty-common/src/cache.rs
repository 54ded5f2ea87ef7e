use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis command {0} timed out")]
    Timeout(&'static str),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Best-effort, read-through copy of user balances. Never the source of truth:
/// readers that miss here go to the store.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    /// `Ok(None)` is a cache miss.
    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CacheError>;

    async fn set_balance(&self, user_id: &str, balance: i64, ttl: Duration)
        -> Result<(), CacheError>;

    async fn delete_balance(&self, user_id: &str) -> Result<(), CacheError>;
}

pub fn balance_key(user_id: &str) -> String {
    format!("balance:{user_id}")
}

/// A `BalanceCache` over a single multiplexed redis connection.
#[derive(Clone)]
pub struct RedisBalanceCache {
    connection: MultiplexedConnection,
    command_timeout: Duration,
}

impl RedisBalanceCache {
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = timeout(command_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout("connect"))??;

        Ok(Self {
            connection,
            command_timeout,
        })
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let fut = cmd.query_async::<String>(&mut conn);
        timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout("PING"))??;

        Ok(())
    }
}

#[async_trait]
impl BalanceCache for RedisBalanceCache {
    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.connection.clone();
        let fut = conn.get::<_, Option<i64>>(balance_key(user_id));
        let balance = timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout("GET"))??;

        Ok(balance)
    }

    async fn set_balance(
        &self,
        user_id: &str,
        balance: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        let fut = conn.set_ex::<_, _, ()>(balance_key(user_id), balance, seconds);
        timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout("SETEX"))??;

        Ok(())
    }

    async fn delete_balance(&self, user_id: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let fut = conn.del::<_, ()>(balance_key(user_id));
        timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout("DEL"))??;

        Ok(())
    }
}
