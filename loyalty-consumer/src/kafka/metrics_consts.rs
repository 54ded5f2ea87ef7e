/// Counter for offset commits requested by partition workers, labelled by status
pub const OFFSET_COMMITS: &str = "loyalty_offset_commits_total";

/// Counter for partitions that stopped consuming after a transient failure
pub const PARTITION_HALTED: &str = "loyalty_partition_halted_total";

/// Counter for errors returned by the consumer, labelled by level and error
pub const KAFKA_CONSUMER_ERRORS: &str = "loyalty_kafka_consumer_errors_total";

/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCES: &str = "loyalty_rebalances_total";

/// Gauge for the number of partitions currently owned
pub const ASSIGNED_PARTITIONS: &str = "loyalty_assigned_partitions";

/// Counter for messages dropped because no live worker owned their partition
pub const MESSAGES_UNROUTED: &str = "loyalty_messages_unrouted_total";

/// Counter for partition worker exits, labelled by reason
pub const PARTITION_WORKER_EXITS: &str = "loyalty_partition_worker_exits_total";
