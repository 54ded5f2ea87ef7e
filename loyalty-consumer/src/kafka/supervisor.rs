//! Partition Supervisor - owns the mapping from assigned partition to worker
//!
//! The mapping is replaced wholesale on every assignment. Superseded workers
//! are cancelled and left to finish their in-flight message; their partition
//! lane keeps any successor from starting before they are done.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::kafka::context::ConsumerCommandSender;
use crate::kafka::metrics_consts::{ASSIGNED_PARTITIONS, MESSAGES_UNROUTED};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_worker::{PartitionLane, PartitionWorker, WorkerDeps};
use crate::kafka::types::{Partition, PartitionMessage, PartitionOffset};
use crate::processor::EventProcessor;

pub struct PartitionSupervisor<P> {
    deps: WorkerDeps<P>,
    channel_size: usize,
    workers: Mutex<HashMap<Partition, PartitionWorker>>,
    lanes: Mutex<HashMap<Partition, PartitionLane>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    runtime: Handle,
}

impl<P: EventProcessor> PartitionSupervisor<P> {
    /// Must be called from within a tokio runtime; workers are spawned on it
    /// even when `assign` runs on a librdkafka callback thread. Every worker
    /// observes `cancel` as well as its own revocation.
    pub fn new(
        processor: Arc<P>,
        offsets: Arc<OffsetTracker>,
        commands: ConsumerCommandSender,
        channel_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deps: WorkerDeps {
                processor,
                offsets,
                commands,
            },
            channel_size,
            workers: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            cancel,
            runtime: Handle::current(),
        }
    }

    fn lane(&self, partition: &Partition) -> PartitionLane {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.entry(partition.clone()).or_default().clone()
    }

    /// Replace the current assignment with `partitions`, spawning a fresh worker
    /// for each one and cancelling every worker it supersedes.
    pub fn assign(&self, partitions: Vec<Partition>) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        let superseded = std::mem::take(&mut *workers);
        for worker in superseded.values() {
            worker.cancel();
        }
        // Positions of superseded partitions are committed on revoke.
        self.deps.offsets.forget(superseded.keys());

        if self.cancel.is_cancelled() {
            warn!("Ignoring assignment of {} partitions after shutdown", partitions.len());
            return;
        }

        for partition in partitions {
            self.deps.offsets.track(&partition);
            let worker = PartitionWorker::spawn(
                partition.clone(),
                self.deps.clone(),
                self.lane(&partition),
                self.cancel.child_token(),
                self.channel_size,
                &self.tasks,
                &self.runtime,
            );
            workers.insert(partition, worker);
        }

        info!(
            superseded = superseded.len(),
            assigned = workers.len(),
            "Installed partition assignment"
        );
        metrics::gauge!(ASSIGNED_PARTITIONS).set(workers.len() as f64);
    }

    /// Cancel every worker and clear the assignment. Returns the last
    /// acknowledged position of every revoked partition that has one, so the
    /// caller can commit it while it still owns the partition.
    pub fn revoke_all(&self) -> Vec<PartitionOffset> {
        let superseded = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };

        for worker in superseded.values() {
            worker.cancel();
        }
        let acknowledged = self.deps.offsets.forget(superseded.keys());
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);

        info!(
            revoked = superseded.len(),
            acknowledged = acknowledged.len(),
            "Revoked partition assignment"
        );

        acknowledged
    }

    /// Hand `message` to the worker owning its partition, waiting for channel
    /// capacity. Returns `false` if the message was dropped because no live
    /// worker owns the partition; it will be redelivered from the last
    /// committed offset.
    pub async fn route(&self, message: PartitionMessage) -> bool {
        let sender = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.get(&message.partition).map(|w| w.sender())
        };

        let Some(sender) = sender else {
            debug!(
                topic = message.partition.topic(),
                partition = message.partition.partition_number(),
                offset = message.offset,
                "No worker for partition, dropping message"
            );
            metrics::counter!(MESSAGES_UNROUTED, "reason" => "unassigned").increment(1);
            return false;
        };

        match sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    topic = e.0.partition.topic(),
                    partition = e.0.partition.partition_number(),
                    offset = e.0.offset,
                    "Partition worker stopped, dropping message"
                );
                metrics::counter!(MESSAGES_UNROUTED, "reason" => "worker_stopped").increment(1);
                false
            }
        }
    }

    /// The currently assigned partitions, ordered by topic and partition number.
    pub fn assignment(&self) -> Vec<Partition> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut partitions: Vec<Partition> = workers.keys().cloned().collect();
        partitions.sort_by(|a, b| {
            (a.topic(), a.partition_number()).cmp(&(b.topic(), b.partition_number()))
        });
        partitions
    }

    /// Partitions whose worker has exited on its own (halted or exhausted).
    pub fn stopped_partitions(&self) -> Vec<Partition> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .values()
            .filter(|w| w.is_finished())
            .map(|w| w.partition().clone())
            .collect()
    }

    /// Cancel all workers, including superseded ones, and wait up to `timeout`
    /// for every worker task to exit. No new workers are started afterwards.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Elapsed> {
        self.cancel.cancel();
        self.revoke_all();
        self.tasks.close();

        tokio::time::timeout(timeout, self.tasks.wait()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::kafka::context::ConsumerCommand;
    use crate::processor::ProcessingOutcome;

    struct AlwaysCommit;

    #[async_trait]
    impl EventProcessor for AlwaysCommit {
        async fn process(&self, _payload: Option<&[u8]>) -> ProcessingOutcome {
            ProcessingOutcome::Committed
        }
    }

    fn supervisor() -> (
        PartitionSupervisor<AlwaysCommit>,
        mpsc::UnboundedReceiver<ConsumerCommand>,
    ) {
        let (commands, rx) = mpsc::unbounded_channel();
        let supervisor = PartitionSupervisor::new(
            Arc::new(AlwaysCommit),
            Arc::new(OffsetTracker::new()),
            commands,
            10,
            CancellationToken::new(),
        );
        (supervisor, rx)
    }

    fn message(partition: &Partition, offset: i64) -> PartitionMessage {
        PartitionMessage {
            partition: partition.clone(),
            offset,
            key: None,
            payload: Some(b"{}".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_assign_replaces_mapping() {
        let (supervisor, _rx) = supervisor();
        let p0 = Partition::new("transactions", 0);
        let p1 = Partition::new("transactions", 1);
        let p2 = Partition::new("transactions", 2);

        supervisor.assign(vec![p0.clone(), p1.clone()]);
        assert_eq!(supervisor.assignment(), vec![p0.clone(), p1.clone()]);

        supervisor.assign(vec![p1.clone(), p2.clone()]);
        assert_eq!(supervisor.assignment(), vec![p1.clone(), p2.clone()]);

        assert!(!supervisor.route(message(&p0, 0)).await);
        assert!(supervisor.route(message(&p2, 0)).await);

        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_all_clears_assignment() {
        let (supervisor, _rx) = supervisor();
        let p0 = Partition::new("transactions", 0);

        supervisor.assign(vec![p0.clone()]);
        let revoked = supervisor.revoke_all();

        // Nothing was acknowledged, so there is nothing to commit.
        assert!(revoked.is_empty());
        assert!(supervisor.assignment().is_empty());
        assert!(!supervisor.route(message(&p0, 0)).await);

        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_all_returns_acknowledged_positions() {
        let (supervisor, mut rx) = supervisor();
        let p0 = Partition::new("transactions", 0);
        let p1 = Partition::new("transactions", 1);
        supervisor.assign(vec![p0.clone(), p1.clone()]);

        for offset in 7..10 {
            assert!(supervisor.route(message(&p0, offset)).await);
        }
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        let revoked = supervisor.revoke_all();

        assert_eq!(revoked, vec![PartitionOffset::new(p0.clone(), 9)]);
        assert_eq!(revoked[0].next_offset(), 10);

        // Revoked partitions are no longer tracked.
        assert!(supervisor.revoke_all().is_empty());

        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_routed_messages_are_committed() {
        let (supervisor, mut rx) = supervisor();
        let p0 = Partition::new("transactions", 0);
        supervisor.assign(vec![p0.clone()]);

        for offset in 0..3 {
            assert!(supervisor.route(message(&p0, offset)).await);
        }

        let mut committed = Vec::new();
        while committed.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ConsumerCommand::Commit(position))) => {
                    committed.push(position.next_offset())
                }
                other => panic!("unexpected command: {other:?}"),
            }
        }
        assert_eq!(committed, vec![1, 2, 3]);

        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_assignment_after_shutdown() {
        let (supervisor, _rx) = supervisor();
        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();

        supervisor.assign(vec![Partition::new("transactions", 0)]);
        assert!(supervisor.assignment().is_empty());
    }
}
