//! Partition Worker - processes the messages of one assigned partition
//!
//! Each partition gets its own worker task fed by a bounded channel, so:
//! 1. Messages of a partition are processed strictly in order, one at a time
//! 2. Partitions are processed concurrently with each other
//! 3. A slow partition applies backpressure to the poll loop
//!
//! Cancellation is only observed between messages. A message that is being
//! processed always runs to completion.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::kafka::context::{ConsumerCommand, ConsumerCommandSender};
use crate::kafka::metrics_consts::{PARTITION_HALTED, PARTITION_WORKER_EXITS};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{Partition, PartitionMessage};
use crate::processor::EventProcessor;

/// Serializes successive workers of the same partition. A worker holds its lane
/// for its whole life, so a replacement cannot start while the worker it
/// supersedes is still finishing a message.
pub type PartitionLane = Arc<Mutex<()>>;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancellation was observed between messages.
    Cancelled,
    /// The channel was closed; the partition is no longer routed here.
    Exhausted,
    /// Processing failed transiently at `offset`; nothing after it was consumed.
    Halted { offset: i64 },
}

impl WorkerExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerExit::Cancelled => "cancelled",
            WorkerExit::Exhausted => "exhausted",
            WorkerExit::Halted { .. } => "halted",
        }
    }
}

/// Shared dependencies handed to every worker.
pub struct WorkerDeps<P> {
    pub processor: Arc<P>,
    pub offsets: Arc<OffsetTracker>,
    pub commands: ConsumerCommandSender,
}

impl<P> Clone for WorkerDeps<P> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            offsets: self.offsets.clone(),
            commands: self.commands.clone(),
        }
    }
}

pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionMessage>,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerExit>,
}

impl PartitionWorker {
    /// Spawn a worker for `partition` on `tasks`. It starts consuming once it
    /// owns `lane`.
    pub fn spawn<P: EventProcessor>(
        partition: Partition,
        deps: WorkerDeps<P>,
        lane: PartitionLane,
        cancel: CancellationToken,
        channel_size: usize,
        tasks: &TaskTracker,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(channel_size);

        let handle = tasks.spawn_on(
            Self::run(partition.clone(), receiver, deps, lane, cancel.clone()),
            runtime,
        );

        Self {
            partition,
            sender,
            cancel,
            handle,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Get a clone of the sender so callers can await on it without holding
    /// any lock over the worker map.
    pub fn sender(&self) -> mpsc::Sender<PartitionMessage> {
        self.sender.clone()
    }

    /// Ask the worker to stop before its next message.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn run<P: EventProcessor>(
        partition: Partition,
        receiver: mpsc::Receiver<PartitionMessage>,
        deps: WorkerDeps<P>,
        lane: PartitionLane,
        cancel: CancellationToken,
    ) -> WorkerExit {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
            guard = lane.lock_owned() => guard,
        };

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Starting partition worker"
        );

        let exit = Self::consume(&partition, receiver, &deps, &cancel, guard).await;

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            exit = ?exit,
            "Partition worker stopped"
        );
        metrics::counter!(PARTITION_WORKER_EXITS, "reason" => exit.as_str()).increment(1);

        exit
    }

    async fn consume<P: EventProcessor>(
        partition: &Partition,
        mut receiver: mpsc::Receiver<PartitionMessage>,
        deps: &WorkerDeps<P>,
        cancel: &CancellationToken,
        _lane: OwnedMutexGuard<()>,
    ) -> WorkerExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WorkerExit::Cancelled,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => return WorkerExit::Exhausted,
                },
            };

            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = message.offset,
                key = ?message.key,
                "Received message"
            );

            let outcome = deps.processor.process(message.payload.as_deref()).await;

            if !outcome.allows_ack() {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = message.offset,
                    "Transient failure, pausing partition until it is reassigned"
                );
                metrics::counter!(PARTITION_HALTED).increment(1);

                if let Err(e) = deps
                    .commands
                    .send(ConsumerCommand::Pause(message.position()))
                {
                    warn!("Failed to request partition pause: {}", e);
                }
                return WorkerExit::Halted {
                    offset: message.offset,
                };
            }

            if !deps.offsets.acknowledge(partition, message.offset) {
                continue;
            }

            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = message.offset,
                outcome = outcome.as_str(),
                "Message processed and offset marked"
            );

            if let Err(e) = deps
                .commands
                .send(ConsumerCommand::Commit(message.position()))
            {
                warn!("Failed to request offset commit: {}", e);
            }
        }
    }
}
