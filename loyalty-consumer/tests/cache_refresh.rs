use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use serde_json::json;
use tokio::sync::Notify;

use loyalty_common::cache::{BalanceCache, CacheError};
use loyalty_common::test_utils::{FailurePoint, MemoryStore};
use loyalty_consumer::processor::{EventProcessor, ProcessingOutcome, TransactionProcessor};
use loyalty_consumer::refresh::CacheRefresher;

mock! {
    pub Cache {}

    #[async_trait]
    impl BalanceCache for Cache {
        async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CacheError>;
        async fn set_balance(&self, user_id: &str, balance: i64, ttl: Duration) -> Result<(), CacheError>;
        async fn delete_balance(&self, user_id: &str) -> Result<(), CacheError>;
    }
}

const TTL: Duration = Duration::from_secs(3600);

fn payload(id: &str, user_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "user_id": user_id,
        "amount": amount,
        "type": "bonus",
        "created_at": "2024-03-15T10:30:00Z"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_refresh_writes_authoritative_balance_with_ttl() {
    let store = Arc::new(MemoryStore::new());
    store.seed_balance("u1", 250);

    let mut cache = MockCache::new();
    cache
        .expect_set_balance()
        .withf(|user_id, balance, ttl| user_id == "u1" && *balance == 250 && *ttl == TTL)
        .times(1)
        .returning(|_, _, _| Ok(()));

    let refresher = CacheRefresher::new(store, Arc::new(cache), TTL);
    assert_eq!(refresher.try_refresh("u1").await.unwrap(), 250);
}

#[tokio::test]
async fn test_store_read_failure_skips_cache() {
    let store = Arc::new(MemoryStore::new());
    store.seed_balance("u1", 250);
    store.fail_at(FailurePoint::ReadBalance);

    let mut cache = MockCache::new();
    cache.expect_set_balance().never();

    let refresher = CacheRefresher::new(store, Arc::new(cache), TTL);
    refresher.refresh("u1").await;
}

#[tokio::test]
async fn test_cache_failure_never_changes_the_outcome() {
    let store = Arc::new(MemoryStore::new());
    let attempted = Arc::new(Notify::new());

    let mut cache = MockCache::new();
    let notify = attempted.clone();
    cache
        .expect_set_balance()
        .times(1)
        .returning(move |_, _, _| {
            notify.notify_one();
            Err(CacheError::Timeout("SETEX"))
        });

    let refresher = CacheRefresher::new(store.clone(), Arc::new(cache), TTL);
    let processor = TransactionProcessor::new(store.clone(), refresher);

    let outcome = processor.process(Some(&payload("t1", "u1", 100))).await;

    assert_eq!(outcome, ProcessingOutcome::Committed);
    assert_eq!(store.balance("u1"), Some(100));

    tokio::time::timeout(Duration::from_secs(5), attempted.notified())
        .await
        .expect("refresh was never attempted");
}

#[tokio::test]
async fn test_rejected_event_schedules_no_refresh() {
    let store = Arc::new(MemoryStore::new());

    let mut cache = MockCache::new();
    cache.expect_set_balance().never();

    let refresher = CacheRefresher::new(store.clone(), Arc::new(cache), TTL);
    let processor = TransactionProcessor::new(store, refresher);

    assert_eq!(
        processor.process(Some(&payload("t1", "u1", 0))).await,
        ProcessingOutcome::RejectedPermanently
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
}
