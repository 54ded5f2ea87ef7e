//! Handling of a single transaction event.
//!
//! An event is validated, then recorded and applied to the user's balance under
//! one store transaction. The transaction handle is always released before
//! `process` returns: committed on success, rolled back on every other path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use loyalty_common::event::{Event, ValidationError};
use loyalty_common::store::{StoreError, TransactionalStore};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::metrics_consts::{EVENT_PROCESSING_DURATION, EVENTS_PROCESSED};
use crate::refresh::RefreshScheduler;

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The transaction is recorded and the balance reflects it.
    Committed,
    /// The event can never be applied (or already was). It is consumed and dropped.
    RejectedPermanently,
    /// Infrastructure failure. The event must be delivered again.
    FailedTransiently,
}

impl ProcessingOutcome {
    /// Whether the event's offset may be acknowledged.
    pub fn allows_ack(&self) -> bool {
        !matches!(self, ProcessingOutcome::FailedTransiently)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Committed => "committed",
            ProcessingOutcome::RejectedPermanently => "rejected",
            ProcessingOutcome::FailedTransiently => "failed",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("malformed input: {0}")]
    MalformedInput(#[from] ValidationError),
    #[error("transaction {0} was already applied")]
    DuplicateTransaction(String),
    #[error("transaction cannot be applied: {0}")]
    Unprocessable(#[source] StoreError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl From<StoreError> for ProcessingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateKey(id) => ProcessingError::DuplicateTransaction(id),
            invalid @ StoreError::InvalidData { .. } => ProcessingError::Unprocessable(invalid),
            other => ProcessingError::StoreUnavailable(other),
        }
    }
}

impl ProcessingError {
    pub fn outcome(&self) -> ProcessingOutcome {
        match self {
            ProcessingError::MalformedInput(_)
            | ProcessingError::DuplicateTransaction(_)
            | ProcessingError::Unprocessable(_) => ProcessingOutcome::RejectedPermanently,
            ProcessingError::StoreUnavailable(_) => ProcessingOutcome::FailedTransiently,
        }
    }
}

/// The unit of work run by a partition worker for every message.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    async fn process(&self, payload: Option<&[u8]>) -> ProcessingOutcome;
}

pub struct TransactionProcessor<S, R> {
    store: Arc<S>,
    refresher: R,
}

impl<S, R> TransactionProcessor<S, R>
where
    S: TransactionalStore + 'static,
    R: RefreshScheduler,
{
    pub fn new(store: Arc<S>, refresher: R) -> Self {
        Self { store, refresher }
    }

    /// Validate and apply a raw payload, returning the applied event.
    pub async fn handle(&self, payload: Option<&[u8]>) -> Result<Event, ProcessingError> {
        let event = Event::from_payload(payload)?;

        self.apply(&event).await?;
        self.refresher.schedule(event.user_id.clone());

        Ok(event)
    }

    /// Record `event` and apply its amount in one store transaction.
    pub async fn apply(&self, event: &Event) -> Result<(), ProcessingError> {
        let mut txn = self.store.begin_transaction().await?;

        let result = self.apply_in(&mut txn, event).await;

        // No-op when the commit already closed the handle.
        self.store.rollback(&mut txn).await;

        result
    }

    async fn apply_in(
        &self,
        txn: &mut S::Transaction,
        event: &Event,
    ) -> Result<(), ProcessingError> {
        self.store.insert_transaction(txn, event).await?;
        self.store
            .increment_balance(txn, &event.user_id, event.amount)
            .await?;
        self.store.commit(txn).await?;
        Ok(())
    }
}

#[async_trait]
impl<S, R> EventProcessor for TransactionProcessor<S, R>
where
    S: TransactionalStore + 'static,
    R: RefreshScheduler,
{
    async fn process(&self, payload: Option<&[u8]>) -> ProcessingOutcome {
        let start = Instant::now();

        let outcome = match self.handle(payload).await {
            Ok(event) => {
                debug!(
                    transaction_id = %event.id,
                    user_id = %event.user_id,
                    amount = event.amount,
                    transaction_type = %event.transaction_type,
                    "Applied transaction"
                );
                ProcessingOutcome::Committed
            }
            Err(e) => {
                let outcome = e.outcome();
                match outcome {
                    ProcessingOutcome::FailedTransiently => {
                        error!(error = %e, "Failed to apply transaction, will be redelivered");
                    }
                    _ => {
                        warn!(error = %e, "Rejected transaction");
                    }
                }
                outcome
            }
        };

        metrics::counter!(EVENTS_PROCESSED, "outcome" => outcome.as_str()).increment(1);
        metrics::histogram!(EVENT_PROCESSING_DURATION).record(start.elapsed().as_secs_f64());

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_common::test_utils::{FailurePoint, MemoryStore};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct RecordingScheduler {
        scheduled: Arc<Mutex<Vec<String>>>,
    }

    impl RefreshScheduler for RecordingScheduler {
        fn schedule(&self, user_id: String) {
            self.scheduled.lock().unwrap().push(user_id);
        }
    }

    fn payload(id: &str, user_id: &str, amount: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "user_id": user_id,
            "amount": amount,
            "type": "purchase",
            "created_at": "2024-03-15T10:30:00Z"
        }))
        .unwrap()
    }

    fn processor() -> (
        Arc<MemoryStore>,
        RecordingScheduler,
        TransactionProcessor<MemoryStore, RecordingScheduler>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = RecordingScheduler::default();
        let processor = TransactionProcessor::new(store.clone(), scheduler.clone());
        (store, scheduler, processor)
    }

    #[tokio::test]
    async fn test_committed_event_schedules_refresh() {
        let (store, scheduler, processor) = processor();

        let outcome = processor.process(Some(&payload("t1", "u1", 25))).await;

        assert_eq!(outcome, ProcessingOutcome::Committed);
        assert_eq!(store.balance("u1"), Some(25));
        assert_eq!(*scheduler.scheduled.lock().unwrap(), vec!["u1".to_string()]);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_releases_handle() {
        let (store, scheduler, processor) = processor();

        processor.process(Some(&payload("t1", "u1", 25))).await;
        let outcome = processor.process(Some(&payload("t1", "u1", 25))).await;

        assert_eq!(outcome, ProcessingOutcome::RejectedPermanently);
        assert_eq!(store.balance("u1"), Some(25));
        assert_eq!(store.rollback_count(), 1);
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(scheduler.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_never_opens_transaction() {
        let (store, _, processor) = processor();

        assert_eq!(
            processor.process(Some(b"not json")).await,
            ProcessingOutcome::RejectedPermanently
        );
        assert_eq!(
            processor.process(None).await,
            ProcessingOutcome::RejectedPermanently
        );
        assert_eq!(store.rollback_count(), 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_failure_is_transient() {
        let (store, scheduler, processor) = processor();
        store.fail_at(FailurePoint::Begin);

        let outcome = processor.process(Some(&payload("t1", "u1", 25))).await;

        assert_eq!(outcome, ProcessingOutcome::FailedTransiently);
        assert!(scheduler.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_rolls_back() {
        let (store, _, processor) = processor();
        store.fail_at(FailurePoint::Insert);

        let outcome = processor.process(Some(&payload("t1", "u1", 25))).await;

        assert_eq!(outcome, ProcessingOutcome::FailedTransiently);
        assert_eq!(store.rollback_count(), 1);
        assert_eq!(store.open_transactions(), 0);
    }

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(
            ProcessingError::from(StoreError::DuplicateKey("t1".into())).outcome(),
            ProcessingOutcome::RejectedPermanently
        );
        assert_eq!(
            ProcessingError::from(StoreError::InvalidData {
                command: "increment_balance",
                message: "bigint out of range".into(),
            })
            .outcome(),
            ProcessingOutcome::RejectedPermanently
        );
        assert_eq!(
            ProcessingError::from(StoreError::TransactionClosed).outcome(),
            ProcessingOutcome::FailedTransiently
        );
        assert_eq!(
            ProcessingError::from(ValidationError::ZeroAmount).outcome(),
            ProcessingOutcome::RejectedPermanently
        );
        assert!(ProcessingOutcome::Committed.allows_ack());
        assert!(ProcessingOutcome::RejectedPermanently.allows_ack());
        assert!(!ProcessingOutcome::FailedTransiently.allows_ack());
    }
}
