use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use futures::future::ready;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loyalty_common::cache::RedisBalanceCache;
use loyalty_common::metrics::{serve, setup_metrics_router};
use loyalty_common::store::PgStore;
use loyalty_consumer::config::Config;
use loyalty_consumer::kafka::{CoordinatorState, GroupCoordinator};
use loyalty_consumer::processor::TransactionProcessor;
use loyalty_consumer::refresh::CacheRefresher;
use loyalty_consumer::shutdown::ShutdownCoordinator;

// Time to flush pending commits and close the consumer once workers drained.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const PG_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

async fn index() -> &'static str {
    "loyalty consumer"
}

fn readiness(state: &watch::Receiver<CoordinatorState>) -> (StatusCode, &'static str) {
    match *state.borrow() {
        CoordinatorState::Consuming => (StatusCode::OK, "ok"),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.as_str()),
    }
}

fn start_server(
    config: &Config,
    state: watch::Receiver<CoordinatorState>,
) -> Result<JoinHandle<()>> {
    let metrics = setup_metrics_router().context("Failed to install metrics recorder")?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness(&state))))
        .route("/_liveness", get(|| ready("ok")))
        .merge(metrics);

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {}: {}", bind, e);
        }
    }))
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level {log_level:?}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.log_level)?;
    info!("Starting loyalty consumer");

    let store = PgStore::connect(
        &config.database_url,
        config.max_pg_connections,
        PG_ACQUIRE_TIMEOUT,
    )
    .await
    .context("Failed to connect to Postgres")?;
    store.ping().await.context("Postgres is not reachable")?;
    let store = Arc::new(store);
    info!("Connected to Postgres");

    let cache = RedisBalanceCache::connect(&config.redis_url, config.redis_timeout())
        .await
        .context("Failed to connect to Redis")?;
    cache.ping().await.context("Redis is not reachable")?;
    info!("Connected to Redis");

    let refresher = CacheRefresher::new(store.clone(), Arc::new(cache), config.cache_ttl());
    let processor = Arc::new(TransactionProcessor::new(store, refresher));

    let coordinator = GroupCoordinator::new(
        config.consumer_config(),
        config.kafka_consumer_topic.clone(),
        processor,
        config.coordinator_settings(),
    );

    let server = start_server(&config, coordinator.subscribe())?;
    info!("Started metrics server on {}", config.bind_address());

    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout() + CLOSE_GRACE);
    let signals = shutdown.listen_for_signals();
    let token = shutdown.token();

    coordinator
        .start(token.clone())
        .await
        .with_context(|| format!("Failed to join consumer group {}", config.kafka_consumer_group))?;

    tokio::select! {
        _ = token.cancelled() => {}
        _ = coordinator.closed() => {}
    }

    let stopped = shutdown.drain(coordinator.stop()).await;

    signals.abort();
    server.abort();

    if let Some(e) = coordinator.take_error() {
        return Err(e).context("Consumer stopped after a fatal error");
    }
    stopped
        .context("Shutdown did not complete")?
        .context("Partition workers did not drain")?;

    info!("Loyalty consumer stopped");
    Ok(())
}
