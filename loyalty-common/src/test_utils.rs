//! In-memory implementations of the store and cache used by tests across the workspace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{BalanceCache, CacheError};
use crate::event::Event;
use crate::store::{StoreError, TransactionalStore};

/// Operations of `MemoryStore` that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Begin,
    Insert,
    Increment,
    Commit,
    ReadBalance,
}

impl FailurePoint {
    fn command(&self) -> &'static str {
        match self {
            FailurePoint::Begin => "begin",
            FailurePoint::Insert => "insert_transaction",
            FailurePoint::Increment => "increment_balance",
            FailurePoint::Commit => "commit",
            FailurePoint::ReadBalance => "read_balance",
        }
    }
}

#[derive(Default)]
struct Committed {
    transactions: HashMap<String, Event>,
    balances: HashMap<String, i64>,
}

/// Writes buffered by an open `MemoryStore` transaction.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    open: bool,
    events: Vec<Event>,
    deltas: Vec<(String, i64)>,
}

/// A `TransactionalStore` that applies a transaction's writes atomically at commit.
#[derive(Default)]
pub struct MemoryStore {
    committed: Mutex<Committed>,
    failures: Mutex<HashSet<FailurePoint>>,
    open: AtomicI64,
    rollbacks: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `point` fail as unavailable until `heal` is called.
    pub fn fail_at(&self, point: FailurePoint) {
        self.failures.lock().unwrap().insert(point);
    }

    pub fn heal(&self, point: FailurePoint) {
        self.failures.lock().unwrap().remove(&point);
    }

    pub fn seed_balance(&self, user_id: &str, balance: i64) {
        self.committed
            .lock()
            .unwrap()
            .balances
            .insert(user_id.to_owned(), balance);
    }

    pub fn balance(&self, user_id: &str) -> Option<i64> {
        self.committed.lock().unwrap().balances.get(user_id).copied()
    }

    pub fn transaction(&self, id: &str) -> Option<Event> {
        self.committed.lock().unwrap().transactions.get(id).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.committed.lock().unwrap().transactions.len()
    }

    /// Transactions begun and not yet committed or rolled back.
    pub fn open_transactions(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn check(&self, point: FailurePoint) -> Result<(), StoreError> {
        if self.failures.lock().unwrap().contains(&point) {
            return Err(StoreError::unavailable(
                point.command(),
                sqlx::Error::PoolTimedOut,
            ));
        }
        Ok(())
    }

    fn close(&self, txn: &mut MemoryTransaction) {
        if txn.open {
            txn.open = false;
            txn.events.clear();
            txn.deltas.clear();
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(&self) -> Result<MemoryTransaction, StoreError> {
        self.check(FailurePoint::Begin)?;
        self.open.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryTransaction {
            open: true,
            ..Default::default()
        })
    }

    async fn insert_transaction(
        &self,
        txn: &mut MemoryTransaction,
        event: &Event,
    ) -> Result<(), StoreError> {
        if !txn.open {
            return Err(StoreError::TransactionClosed);
        }
        self.check(FailurePoint::Insert)?;

        let duplicate = self
            .committed
            .lock()
            .unwrap()
            .transactions
            .contains_key(&event.id)
            || txn.events.iter().any(|e| e.id == event.id);
        if duplicate {
            return Err(StoreError::DuplicateKey(event.id.clone()));
        }

        txn.events.push(event.clone());
        Ok(())
    }

    async fn increment_balance(
        &self,
        txn: &mut MemoryTransaction,
        user_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        if !txn.open {
            return Err(StoreError::TransactionClosed);
        }
        self.check(FailurePoint::Increment)?;

        let current = self.balance(user_id).unwrap_or(0);
        let pending = txn
            .deltas
            .iter()
            .filter(|(user, _)| user == user_id)
            .try_fold(current, |balance, (_, d)| balance.checked_add(*d));
        if pending.and_then(|balance| balance.checked_add(delta)).is_none() {
            return Err(out_of_range("increment_balance"));
        }

        txn.deltas.push((user_id.to_owned(), delta));
        Ok(())
    }

    async fn commit(&self, txn: &mut MemoryTransaction) -> Result<(), StoreError> {
        if !txn.open {
            return Err(StoreError::TransactionClosed);
        }
        if let Err(e) = self.check(FailurePoint::Commit) {
            self.close(txn);
            return Err(e);
        }

        let result = {
            let mut committed = self.committed.lock().unwrap();
            // A concurrent transaction may have recorded the same id since our insert.
            match txn
                .events
                .iter()
                .find(|e| committed.transactions.contains_key(&e.id))
            {
                Some(e) => Err(StoreError::DuplicateKey(e.id.clone())),
                None => match apply_deltas(&committed.balances, &txn.deltas) {
                    Some(balances) => {
                        for event in txn.events.drain(..) {
                            committed.transactions.insert(event.id.clone(), event);
                        }
                        committed.balances.extend(balances);
                        Ok(())
                    }
                    None => Err(out_of_range("commit")),
                },
            }
        };

        if result.is_ok() {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        self.close(txn);
        result
    }

    async fn rollback(&self, txn: &mut MemoryTransaction) {
        if txn.open {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.close(txn);
        }
    }

    async fn read_balance(&self, user_id: &str) -> Result<i64, StoreError> {
        self.check(FailurePoint::ReadBalance)?;

        self.balance(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_owned()))
    }
}

fn out_of_range(command: &'static str) -> StoreError {
    StoreError::InvalidData {
        command,
        message: "bigint out of range".to_owned(),
    }
}

/// New balances for every user touched by `deltas`, or `None` on overflow.
fn apply_deltas(
    balances: &HashMap<String, i64>,
    deltas: &[(String, i64)],
) -> Option<HashMap<String, i64>> {
    let mut updated: HashMap<String, i64> = HashMap::new();
    for (user_id, delta) in deltas {
        let current = match updated.get(user_id) {
            Some(balance) => *balance,
            None => balances.get(user_id).copied().unwrap_or(0),
        };
        updated.insert(user_id.clone(), current.checked_add(*delta)?);
    }
    Some(updated)
}

/// A `BalanceCache` backed by a map, with a switch to make every command fail.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (i64, Duration)>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn cached(&self, user_id: &str) -> Option<i64> {
        self.entries
            .lock()
            .unwrap()
            .get(user_id)
            .map(|(balance, _)| *balance)
    }

    pub fn ttl(&self, user_id: &str) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(user_id)
            .map(|(_, ttl)| *ttl)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, command: &'static str) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout(command));
        }
        Ok(())
    }
}

#[async_trait]
impl BalanceCache for MemoryCache {
    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CacheError> {
        self.check("GET")?;
        Ok(self.cached(user_id))
    }

    async fn set_balance(
        &self,
        user_id: &str,
        balance: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check("SETEX")?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .insert(user_id.to_owned(), (balance, ttl));
        Ok(())
    }

    async fn delete_balance(&self, user_id: &str) -> Result<(), CacheError> {
        self.check("DEL")?;
        self.entries.lock().unwrap().remove(user_id);
        Ok(())
    }
}
