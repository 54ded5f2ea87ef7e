//! Group Coordinator - membership in the consumer group and the poll loop
//!
//! `start` joins the group and returns once the first assignment has been
//! installed. From then on a single poll loop owns the consumer: it routes
//! fetched messages to partition workers and executes the commit and pause
//! requests they send back. Rebalances are applied by [`RebalanceContext`]
//! from inside the poll.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::TopicPartitionList;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kafka::context::{
    commit_list, ConsumerCommand, ConsumerCommandReceiver, RebalanceContext,
};
use crate::kafka::metrics_consts::{KAFKA_CONSUMER_ERRORS, OFFSET_COMMITS};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::supervisor::PartitionSupervisor;
use crate::kafka::types::PartitionMessage;
use crate::processor::EventProcessor;

type LoyaltyConsumer<P> = StreamConsumer<RebalanceContext<P>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Joining,
    Ready,
    Consuming,
    Rebalancing,
    Closing,
    Stopped,
}

impl CoordinatorState {
    /// No further transitions other than `Closing -> Stopped`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Closing | CoordinatorState::Stopped)
    }

    /// The state a rebalance callback moves to, or `None` if `event` leaves the
    /// state unchanged. `Ready` is promoted to `Consuming` by `start`.
    pub fn on_rebalance(self, event: RebalanceEvent) -> Option<CoordinatorState> {
        let next = match (self, event) {
            (CoordinatorState::Closing | CoordinatorState::Stopped, _) => self,
            // Nothing is owned before the first assignment.
            (CoordinatorState::Joining, RebalanceEvent::Revoke) => self,
            (CoordinatorState::Joining, RebalanceEvent::Assign) => CoordinatorState::Ready,
            (CoordinatorState::Ready, RebalanceEvent::Assign) => CoordinatorState::Ready,
            (
                CoordinatorState::Ready
                | CoordinatorState::Consuming
                | CoordinatorState::Rebalancing,
                RebalanceEvent::Revoke,
            ) => CoordinatorState::Rebalancing,
            (
                CoordinatorState::Consuming | CoordinatorState::Rebalancing,
                RebalanceEvent::Assign,
            ) => CoordinatorState::Consuming,
        };

        (next != self).then_some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Joining => "joining",
            CoordinatorState::Ready => "ready",
            CoordinatorState::Consuming => "consuming",
            CoordinatorState::Rebalancing => "rebalancing",
            CoordinatorState::Closing => "closing",
            CoordinatorState::Stopped => "stopped",
        }
    }
}

/// Rebalance callbacks that drive the coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceEvent {
    Revoke,
    Assign,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("failed to create consumer: {0}")]
    Create(#[source] KafkaError),
    #[error("failed to subscribe to {topic}: {error}")]
    Subscribe {
        topic: String,
        #[source]
        error: KafkaError,
    },
    #[error("no partition assignment received within {0:?}")]
    JoinTimeout(Duration),
    #[error("consumer transport failed: {0}")]
    Transport(#[source] KafkaError),
    #[error("cancelled before joining the group")]
    Cancelled,
    #[error("coordinator was already started")]
    AlreadyStarted,
    #[error("partition workers did not exit within {0:?}")]
    DrainTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub join_timeout: Duration,
    pub drain_timeout: Duration,
    pub channel_size: usize,
}

struct Running<P: EventProcessor> {
    consumer: Arc<LoyaltyConsumer<P>>,
    supervisor: Arc<PartitionSupervisor<P>>,
    poll_cancel: CancellationToken,
    poll: JoinHandle<()>,
}

pub struct GroupCoordinator<P: EventProcessor> {
    client_config: ClientConfig,
    topic: String,
    processor: Arc<P>,
    settings: CoordinatorSettings,
    state: Arc<watch::Sender<CoordinatorState>>,
    failure: Arc<Mutex<Option<CoordinatorError>>>,
    running: tokio::sync::Mutex<Option<Running<P>>>,
}

impl<P: EventProcessor> GroupCoordinator<P> {
    pub fn new(
        client_config: ClientConfig,
        topic: impl Into<String>,
        processor: Arc<P>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Stopped);

        Self {
            client_config,
            topic: topic.into(),
            processor,
            settings,
            state: Arc::new(state),
            failure: Arc::new(Mutex::new(None)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Take the error that stopped the poll loop after `start` returned, if any.
    pub fn take_error(&self) -> Option<CoordinatorError> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Resolves once the coordinator starts closing, either through `stop` or
    /// because the poll loop hit a fatal error.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        if state.wait_for(|s| s.is_terminal()).await.is_err() {
            warn!("Coordinator state channel closed");
        }
    }

    /// Join the group and wait for the first assignment.
    ///
    /// Partition workers observe `cancel` between messages. Errors creating or
    /// subscribing the consumer are returned directly, as is a timeout or
    /// cancellation before the group was joined.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), CoordinatorError> {
        {
            let mut running = self.running.lock().await;
            if running.is_some() {
                return Err(CoordinatorError::AlreadyStarted);
            }

            self.failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            self.state.send_replace(CoordinatorState::Joining);

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let supervisor = Arc::new(PartitionSupervisor::new(
                self.processor.clone(),
                Arc::new(OffsetTracker::new()),
                commands_tx,
                self.settings.channel_size,
                cancel.child_token(),
            ));
            let context = RebalanceContext::new(supervisor.clone(), self.state.clone());

            let created: Result<LoyaltyConsumer<P>, KafkaError> =
                self.client_config.create_with_context(context);
            let consumer = match created {
                Ok(consumer) => consumer,
                Err(error) => {
                    self.state.send_replace(CoordinatorState::Stopped);
                    return Err(CoordinatorError::Create(error));
                }
            };

            if let Err(error) = consumer.subscribe(&[self.topic.as_str()]) {
                self.state.send_replace(CoordinatorState::Stopped);
                return Err(CoordinatorError::Subscribe {
                    topic: self.topic.clone(),
                    error,
                });
            }

            info!(topic = %self.topic, "Subscribed, waiting for partition assignment");

            let consumer = Arc::new(consumer);
            let poll_cancel = CancellationToken::new();
            let poll = tokio::spawn(poll_loop(
                consumer.clone(),
                supervisor.clone(),
                commands_rx,
                poll_cancel.clone(),
                self.state.clone(),
                self.failure.clone(),
            ));

            *running = Some(Running {
                consumer,
                supervisor,
                poll_cancel,
                poll,
            });
        }

        let mut state = self.state.subscribe();
        let joined = tokio::select! {
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
            result = tokio::time::timeout(
                self.settings.join_timeout,
                state.wait_for(|s| *s != CoordinatorState::Joining),
            ) => match result {
                Ok(Ok(current)) if !current.is_terminal() => Ok(()),
                Ok(_) => Err(self.take_error().unwrap_or(CoordinatorError::Cancelled)),
                Err(_) => Err(CoordinatorError::JoinTimeout(self.settings.join_timeout)),
            },
        };

        match joined {
            Ok(()) => {
                self.state.send_if_modified(|s| {
                    if *s == CoordinatorState::Ready {
                        *s = CoordinatorState::Consuming;
                        return true;
                    }
                    false
                });
                info!(topic = %self.topic, "Joined consumer group");
                Ok(())
            }
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Failed to join consumer group");
                if let Err(stop_error) = self.stop().await {
                    warn!(error = %stop_error, "Failed to stop after unsuccessful start");
                }
                Err(e)
            }
        }
    }

    /// Leave the group and wait for every partition worker to exit.
    ///
    /// Workers get `drain_timeout` to finish their in-flight message. Commits
    /// they request while draining are flushed before the consumer closes.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let Some(running) = self.running.lock().await.take() else {
            self.state.send_replace(CoordinatorState::Stopped);
            return Ok(());
        };

        self.state.send_replace(CoordinatorState::Closing);
        info!("Stopping group coordinator");

        let drained = running
            .supervisor
            .shutdown(self.settings.drain_timeout)
            .await
            .map_err(|_| CoordinatorError::DrainTimeout(self.settings.drain_timeout));
        if drained.is_err() {
            warn!(
                timeout = ?self.settings.drain_timeout,
                "Partition workers did not exit in time"
            );
        }

        running.poll_cancel.cancel();
        if let Err(e) = running.poll.await {
            error!("Poll loop panicked: {}", e);
        }

        running.consumer.unsubscribe();
        drop(running.consumer);

        self.state.send_replace(CoordinatorState::Stopped);
        info!("Group coordinator stopped");

        drained
    }
}

async fn poll_loop<P: EventProcessor>(
    consumer: Arc<LoyaltyConsumer<P>>,
    supervisor: Arc<PartitionSupervisor<P>>,
    mut commands: ConsumerCommandReceiver,
    cancel: CancellationToken,
    state: Arc<watch::Sender<CoordinatorState>>,
    failure: Arc<Mutex<Option<CoordinatorError>>>,
) {
    let mut consecutive_errors: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(command) = commands.recv() => {
                execute(&consumer, command, CommitMode::Async);
            }

            received = consumer.recv() => {
                let received = received.map(|message| PartitionMessage::from(&message));

                match received {
                    Ok(message) => {
                        consecutive_errors = 0;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = supervisor.route(message) => {}
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        match classify_error(&e, consecutive_errors) {
                            ErrorAction::Retry(backoff) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = sleep(backoff) => {}
                                }
                            }
                            ErrorAction::Fatal => {
                                error!(error = %e, "Fatal consumer error, stopping");
                                state.send_replace(CoordinatorState::Closing);
                                supervisor.revoke_all();
                                *failure.lock().unwrap_or_else(|e| e.into_inner()) =
                                    Some(CoordinatorError::Transport(e));
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    // Workers may have finished messages after the last poll.
    while let Ok(command) = commands.try_recv() {
        execute(&consumer, command, CommitMode::Sync);
    }
}

fn execute<P: EventProcessor>(
    consumer: &LoyaltyConsumer<P>,
    command: ConsumerCommand,
    mode: CommitMode,
) {
    match command {
        ConsumerCommand::Commit(position) => {
            let list = match commit_list(std::slice::from_ref(&position)) {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "Invalid offset for commit: {:?}", position);
                    return;
                }
            };

            match consumer.commit(&list, mode) {
                Ok(()) => {
                    metrics::counter!(OFFSET_COMMITS, "status" => "ok").increment(1);
                }
                Err(e) => {
                    warn!(
                        topic = position.topic(),
                        partition = position.partition_number(),
                        offset = position.offset(),
                        error = %e,
                        "Failed to commit offset"
                    );
                    metrics::counter!(OFFSET_COMMITS, "status" => "failed").increment(1);
                }
            }
        }
        ConsumerCommand::Pause(position) => {
            let mut list = TopicPartitionList::new();
            list.add_partition(position.topic(), position.partition_number());

            match consumer.pause(&list) {
                Ok(()) => info!(
                    topic = position.topic(),
                    partition = position.partition_number(),
                    offset = position.offset(),
                    "Paused partition"
                ),
                Err(e) => warn!(
                    topic = position.topic(),
                    partition = position.partition_number(),
                    error = %e,
                    "Failed to pause partition"
                ),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ErrorAction {
    Retry(Duration),
    Fatal,
}

/// Decide whether a consumer error is worth waiting out. Backoff grows with
/// the number of consecutive errors.
fn classify_error(e: &KafkaError, consecutive: u64) -> ErrorAction {
    let (level, label, action) = match e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => {
                ("info", "partition_eof", ErrorAction::Retry(Duration::ZERO))
            }
            RDKafkaErrorCode::OperationTimedOut => {
                ("info", "op_timed_out", ErrorAction::Retry(Duration::ZERO))
            }
            // "auto.offset.reset" repositions the partition with the broker
            RDKafkaErrorCode::OffsetOutOfRange => (
                "info",
                "offset_out_of_range",
                ErrorAction::Retry(Duration::from_millis(500)),
            ),
            _ => (
                "warn",
                "consumer",
                ErrorAction::Retry(Duration::from_millis(100 * consecutive.min(10))),
            ),
        },
        KafkaError::MessageConsumptionFatal(_) => ("fatal", "consumer", ErrorAction::Fatal),
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => (
                "warn",
                "all_brokers_down",
                ErrorAction::Retry(Duration::from_secs(consecutive.min(5))),
            ),
            RDKafkaErrorCode::BrokerTransportFailure => (
                "warn",
                "broker_transport",
                ErrorAction::Retry(Duration::from_secs(consecutive.min(3))),
            ),
            RDKafkaErrorCode::Authentication => ("fatal", "authentication", ErrorAction::Fatal),
            _ => (
                "warn",
                "global",
                ErrorAction::Retry(Duration::from_millis(500 * consecutive.min(6))),
            ),
        },
        KafkaError::Canceled => ("info", "canceled", ErrorAction::Fatal),
        _ => (
            "warn",
            "unexpected",
            ErrorAction::Retry(Duration::from_millis(100 * consecutive.min(10))),
        ),
    };

    if action != ErrorAction::Retry(Duration::ZERO) {
        warn!(level = level, error = %e, "Kafka consumer error");
    }
    metrics::counter!(KAFKA_CONSUMER_ERRORS, &[("level", level), ("error", label)]).increment(1);

    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::kafka::config::ConsumerConfigBuilder;
    use crate::processor::ProcessingOutcome;

    struct AlwaysCommit;

    #[async_trait]
    impl EventProcessor for AlwaysCommit {
        async fn process(&self, _payload: Option<&[u8]>) -> ProcessingOutcome {
            ProcessingOutcome::Committed
        }
    }

    fn coordinator(bootstrap: &str, join_timeout: Duration) -> GroupCoordinator<AlwaysCommit> {
        let config = ConsumerConfigBuilder::new(bootstrap, "loyalty-test-group")
            .with_offset_reset("earliest")
            .build();

        GroupCoordinator::new(
            config,
            "transactions",
            Arc::new(AlwaysCommit),
            CoordinatorSettings {
                join_timeout,
                drain_timeout: Duration::from_secs(1),
                channel_size: 10,
            },
        )
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error(
                &KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
                1
            ),
            ErrorAction::Retry(Duration::ZERO)
        );
        assert_eq!(
            classify_error(
                &KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
                10
            ),
            ErrorAction::Retry(Duration::from_secs(5))
        );
        assert_eq!(
            classify_error(
                &KafkaError::Global(RDKafkaErrorCode::Authentication),
                1
            ),
            ErrorAction::Fatal
        );
        assert_eq!(
            classify_error(
                &KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
                1
            ),
            ErrorAction::Fatal
        );
    }

    #[test]
    fn test_rebalance_transitions() {
        use CoordinatorState as S;
        use RebalanceEvent as E;

        let cases = [
            (S::Joining, E::Assign, Some(S::Ready)),
            (S::Joining, E::Revoke, None),
            (S::Ready, E::Assign, None),
            (S::Ready, E::Revoke, Some(S::Rebalancing)),
            (S::Consuming, E::Revoke, Some(S::Rebalancing)),
            (S::Consuming, E::Assign, None),
            (S::Rebalancing, E::Assign, Some(S::Consuming)),
            (S::Rebalancing, E::Revoke, None),
            (S::Closing, E::Assign, None),
            (S::Closing, E::Revoke, None),
            (S::Stopped, E::Assign, None),
            (S::Stopped, E::Revoke, None),
        ];

        for (state, event, expected) in cases {
            assert_eq!(
                state.on_rebalance(event),
                expected,
                "{state:?} on {event:?}"
            );
        }
    }

    #[test]
    fn test_rebalance_cycle_returns_to_consuming() {
        let mut state = CoordinatorState::Joining;
        // An empty first assignment still completes the join.
        for event in [
            RebalanceEvent::Assign,
            RebalanceEvent::Revoke,
            RebalanceEvent::Assign,
            RebalanceEvent::Revoke,
            RebalanceEvent::Assign,
        ] {
            if let Some(next) = state.on_rebalance(event) {
                state = next;
            }
        }
        assert_eq!(state, CoordinatorState::Consuming);
    }

    #[test]
    fn test_terminal_states() {
        assert!(CoordinatorState::Closing.is_terminal());
        assert!(CoordinatorState::Stopped.is_terminal());
        assert!(!CoordinatorState::Rebalancing.is_terminal());
        assert!(!CoordinatorState::Joining.is_terminal());
    }

    #[tokio::test]
    async fn test_start_times_out_without_broker() {
        let coordinator = coordinator("127.0.0.1:1", Duration::from_millis(500));

        let result = coordinator.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(CoordinatorError::JoinTimeout(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_observes_cancellation() {
        let coordinator = coordinator("127.0.0.1:1", Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator.start(cancel).await;

        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let coordinator = coordinator("127.0.0.1:1", Duration::from_secs(1));
        coordinator.stop().await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    }
}
