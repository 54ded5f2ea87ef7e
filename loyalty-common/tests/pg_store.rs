use chrono::Utc;
use sqlx::PgPool;

use loyalty_common::event::{Event, TransactionType};
use loyalty_common::store::{PgStore, StoreError, TransactionalStore};

fn event(id: &str, user_id: &str, amount: i64) -> Event {
    Event {
        id: id.to_owned(),
        user_id: user_id.to_owned(),
        amount,
        transaction_type: TransactionType::Purchase,
        created_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires a running postgres (DATABASE_URL)"]
async fn test_commit_records_transaction_and_balance(db: PgPool) {
    let store = PgStore::new(db);

    let mut txn = store.begin_transaction().await.unwrap();
    store
        .insert_transaction(&mut txn, &event("t1", "u1", 100))
        .await
        .unwrap();
    store.increment_balance(&mut txn, "u1", 100).await.unwrap();
    store.commit(&mut txn).await.unwrap();

    assert_eq!(store.read_balance("u1").await.unwrap(), 100);

    let recorded: i64 = sqlx::query_scalar("SELECT amount FROM transactions WHERE id = $1")
        .bind("t1")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(recorded, 100);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires a running postgres (DATABASE_URL)"]
async fn test_duplicate_insert_is_reported(db: PgPool) {
    let store = PgStore::new(db);

    let mut txn = store.begin_transaction().await.unwrap();
    store
        .insert_transaction(&mut txn, &event("t1", "u1", 100))
        .await
        .unwrap();
    store.commit(&mut txn).await.unwrap();

    let mut txn = store.begin_transaction().await.unwrap();
    let err = store
        .insert_transaction(&mut txn, &event("t1", "u1", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(id) if id == "t1"));
    store.rollback(&mut txn).await;
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires a running postgres (DATABASE_URL)"]
async fn test_rollback_leaves_no_trace(db: PgPool) {
    let store = PgStore::new(db);

    let mut txn = store.begin_transaction().await.unwrap();
    store
        .insert_transaction(&mut txn, &event("t1", "u1", 100))
        .await
        .unwrap();
    store.increment_balance(&mut txn, "u1", 100).await.unwrap();
    store.rollback(&mut txn).await;
    // Second rollback is a no-op.
    store.rollback(&mut txn).await;

    assert!(matches!(
        store.read_balance("u1").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.commit(&mut txn).await,
        Err(StoreError::TransactionClosed)
    ));
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires a running postgres (DATABASE_URL)"]
async fn test_concurrent_increments_are_not_lost(db: PgPool) {
    let store = PgStore::new(db);

    let first = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut txn = store.begin_transaction().await.unwrap();
            store
                .insert_transaction(&mut txn, &event("t1", "u1", 10))
                .await
                .unwrap();
            store.increment_balance(&mut txn, "u1", 10).await.unwrap();
            store.commit(&mut txn).await.unwrap();
        })
    };
    let second = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut txn = store.begin_transaction().await.unwrap();
            store
                .insert_transaction(&mut txn, &event("t2", "u1", 5))
                .await
                .unwrap();
            store.increment_balance(&mut txn, "u1", 5).await.unwrap();
            store.commit(&mut txn).await.unwrap();
        })
    };

    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(store.read_balance("u1").await.unwrap(), 15);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires a running postgres (DATABASE_URL)"]
async fn test_balance_overflow_is_invalid_data(db: PgPool) {
    let store = PgStore::new(db);
    let half = i64::MAX / 2 + 1;

    let mut txn = store.begin_transaction().await.unwrap();
    store.increment_balance(&mut txn, "u1", half).await.unwrap();
    store.commit(&mut txn).await.unwrap();

    let mut txn = store.begin_transaction().await.unwrap();
    let err = store
        .increment_balance(&mut txn, "u1", half)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidData { command: "increment_balance", .. }
    ));
    store.rollback(&mut txn).await;

    assert_eq!(store.read_balance("u1").await.unwrap(), half);
}
