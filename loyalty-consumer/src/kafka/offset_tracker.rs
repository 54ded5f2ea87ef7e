//! Offset Tracker - the acknowledged offset of every owned partition
//!
//! Partition workers acknowledge a message once it reached a final outcome. The
//! tracker only ever moves forward: an acknowledgment at or below the current
//! high-water mark is ignored and reported back to the caller so it can skip
//! the commit. Acknowledgments for partitions that are not tracked are dropped.

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::types::{Partition, PartitionOffset};

#[derive(Default)]
pub struct OffsetTracker {
    acknowledged: DashMap<Partition, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a partition this process now owns.
    pub fn track(&self, partition: &Partition) {
        self.acknowledged.entry(partition.clone()).or_insert(-1);
    }

    /// Record `offset` as the last message handled on `partition`.
    ///
    /// Returns `false` when the partition is not tracked or the offset does not
    /// advance the high-water mark.
    pub fn acknowledge(&self, partition: &Partition, offset: i64) -> bool {
        let Some(mut entry) = self.acknowledged.get_mut(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Ignoring acknowledgment for a partition that is no longer owned"
            );
            return false;
        };

        if offset <= *entry {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                acknowledged = *entry,
                "Ignoring acknowledgment that does not advance the partition"
            );
            return false;
        }

        *entry = offset;
        true
    }

    /// The last acknowledged offset for `partition`, if any.
    pub fn acknowledged(&self, partition: &Partition) -> Option<i64> {
        self.acknowledged
            .get(partition)
            .map(|offset| *offset)
            .filter(|offset| *offset >= 0)
    }

    /// Stop tracking `partitions`, returning the last acknowledged position of
    /// each one that had any.
    pub fn forget<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a Partition>,
    ) -> Vec<PartitionOffset> {
        partitions
            .into_iter()
            .filter_map(|partition| self.acknowledged.remove(partition))
            .filter(|(_, offset)| *offset >= 0)
            .map(|(partition, offset)| PartitionOffset::new(partition, offset))
            .collect()
    }
}
