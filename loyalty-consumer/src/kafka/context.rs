use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::kafka::coordinator::{CoordinatorState, RebalanceEvent};
use crate::kafka::metrics_consts::{OFFSET_COMMITS, REBALANCES};
use crate::kafka::supervisor::PartitionSupervisor;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::processor::EventProcessor;

/// Requests from partition workers to the poll loop, which owns the consumer.
#[derive(Debug)]
pub enum ConsumerCommand {
    /// Store `offset + 1` as the group's position for the partition.
    Commit(PartitionOffset),
    /// Stop fetching the partition; nothing at or after `offset` was acknowledged.
    Pause(PartitionOffset),
}

/// Sender for consumer commands - held by every partition worker
pub type ConsumerCommandSender = mpsc::UnboundedSender<ConsumerCommand>;
/// Receiver for consumer commands - held by the poll loop
pub type ConsumerCommandReceiver = mpsc::UnboundedReceiver<ConsumerCommand>;

/// The group positions to store for `positions`: the offset after each one.
pub fn commit_list(positions: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for position in positions {
        list.add_partition_offset(
            position.topic(),
            position.partition_number(),
            Offset::Offset(position.next_offset()),
        )?;
    }
    Ok(list)
}

/// Consumer context that keeps the partition supervisor in step with the
/// group's assignment.
///
/// Rebalance callbacks run synchronously inside the consumer's poll, so the
/// supervisor is updated before any message of a new assignment is fetched.
pub struct RebalanceContext<P> {
    supervisor: Arc<PartitionSupervisor<P>>,
    state: Arc<watch::Sender<CoordinatorState>>,
}

impl<P: EventProcessor> RebalanceContext<P> {
    pub fn new(
        supervisor: Arc<PartitionSupervisor<P>>,
        state: Arc<watch::Sender<CoordinatorState>>,
    ) -> Self {
        Self { supervisor, state }
    }

    fn transition(&self, event: RebalanceEvent) {
        self.state
            .send_if_modified(|current| match current.on_rebalance(event) {
                Some(next) => {
                    debug!(
                        from = ?*current,
                        to = ?next,
                        event = ?event,
                        "Coordinator state change"
                    );
                    *current = next;
                    true
                }
                None => false,
            });
    }

    /// Commit what was acknowledged on the revoked partitions while this member
    /// still belongs to the generation that owns them.
    fn commit_revoked(&self, consumer: &BaseConsumer<Self>, acknowledged: &[PartitionOffset]) {
        if acknowledged.is_empty() {
            return;
        }

        let committed = commit_list(acknowledged)
            .and_then(|list| consumer.commit(&list, CommitMode::Sync));

        match committed {
            Ok(()) => {
                info!(
                    partitions = acknowledged.len(),
                    "Committed acknowledged offsets before revoke"
                );
                metrics::counter!(OFFSET_COMMITS, "status" => "ok").increment(1);
            }
            Err(e) => {
                warn!(
                    partitions = acknowledged.len(),
                    error = %e,
                    "Failed to commit acknowledged offsets before revoke"
                );
                metrics::counter!(OFFSET_COMMITS, "status" => "failed").increment(1);
            }
        }
    }

    fn partitions(list: &TopicPartitionList) -> Vec<Partition> {
        list.elements().into_iter().map(Partition::from).collect()
    }
}

impl<P: EventProcessor> ClientContext for RebalanceContext<P> {}

impl<P: EventProcessor> ConsumerContext for RebalanceContext<P> {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                metrics::counter!(REBALANCES, "event_type" => "revoke").increment(1);

                self.transition(RebalanceEvent::Revoke);
                let acknowledged = self.supervisor.revoke_all();
                self.commit_revoked(base_consumer, &acknowledged);
            }
            Rebalance::Assign(partitions) => {
                info!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                metrics::counter!(REBALANCES, "event_type" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned = Self::partitions(partitions);
                info!(
                    partitions = ?assigned,
                    "Assigned {} partitions",
                    assigned.len()
                );
                metrics::counter!(REBALANCES, "event_type" => "assign").increment(1);

                self.supervisor.assign(assigned);

                // The first assignment, even an empty one, completes the join.
                self.transition(RebalanceEvent::Assign);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_list_stores_next_offset() {
        let positions = vec![
            PartitionOffset::new(Partition::new("transactions", 0), 9),
            PartitionOffset::new(Partition::new("transactions", 3), 0),
        ];

        let list = commit_list(&positions).unwrap();

        assert_eq!(list.count(), 2);
        assert_eq!(
            list.find_partition("transactions", 0).unwrap().offset(),
            Offset::Offset(10)
        );
        assert_eq!(
            list.find_partition("transactions", 3).unwrap().offset(),
            Offset::Offset(1)
        );
    }
}
