use std::fmt;

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Position of a processed message within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The offset to store in the group: the next one to be consumed.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// An owned copy of one log record, detached from the consumer's buffers so
/// it can be handed to a partition worker.
#[derive(Debug, Clone)]
pub struct PartitionMessage {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl From<&BorrowedMessage<'_>> for PartitionMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(|payload| payload.to_vec()),
        }
    }
}

impl PartitionMessage {
    pub fn position(&self) -> PartitionOffset {
        PartitionOffset::new(self.partition.clone(), self.offset)
    }
}
