//! Post-commit balance refresh.
//!
//! After an event commits, the authoritative balance is copied into the cache
//! on a detached task. The cache is advisory: every failure here is logged and
//! dropped, and nothing waits for the task.

use std::sync::Arc;
use std::time::Duration;

use loyalty_common::cache::{BalanceCache, CacheError};
use loyalty_common::store::{StoreError, TransactionalStore};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics_consts::CACHE_REFRESH;

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("failed to read balance: {0}")]
    Store(#[from] StoreError),
    #[error("failed to write balance to cache: {0}")]
    Cache(#[from] CacheError),
}

/// Fire-and-forget scheduling of a cache refresh for one user.
pub trait RefreshScheduler: Send + Sync + 'static {
    fn schedule(&self, user_id: String);
}

pub struct CacheRefresher<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    ttl: Duration,
}

impl<S, C> Clone for CacheRefresher<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            ttl: self.ttl,
        }
    }
}

impl<S, C> CacheRefresher<S, C>
where
    S: TransactionalStore + 'static,
    C: BalanceCache + 'static,
{
    pub fn new(store: Arc<S>, cache: Arc<C>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    /// Read the committed balance and write it to the cache.
    pub async fn try_refresh(&self, user_id: &str) -> Result<i64, RefreshError> {
        let balance = self.store.read_balance(user_id).await?;
        self.cache.set_balance(user_id, balance, self.ttl).await?;
        Ok(balance)
    }

    pub async fn refresh(&self, user_id: &str) {
        match self.try_refresh(user_id).await {
            Ok(balance) => {
                debug!(user_id = user_id, balance = balance, "Refreshed cached balance");
                metrics::counter!(CACHE_REFRESH, "status" => "ok").increment(1);
            }
            Err(e) => {
                warn!(user_id = user_id, error = %e, "Failed to refresh cached balance");
                metrics::counter!(CACHE_REFRESH, "status" => "failed").increment(1);
            }
        }
    }
}

impl<S, C> RefreshScheduler for CacheRefresher<S, C>
where
    S: TransactionalStore + 'static,
    C: BalanceCache + 'static,
{
    fn schedule(&self, user_id: String) {
        let refresher = self.clone();
        tokio::spawn(async move {
            refresher.refresh(&user_id).await;
        });
    }
}
