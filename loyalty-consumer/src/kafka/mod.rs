// Kafka module - group membership, per-partition workers and offset commits
pub mod config;
pub mod context;
pub mod coordinator;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_worker;
pub mod supervisor;
pub mod types;

// Public API
pub use config::ConsumerConfigBuilder;
pub use coordinator::{CoordinatorError, CoordinatorSettings, CoordinatorState, GroupCoordinator};
