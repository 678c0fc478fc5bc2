use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tideline_core::{Dispatcher, JobRunner, SignalRegistry, WorkerPool};
use tokio::signal;
use tracing::{info, warn};

use crate::config::{Backend, ServerConfig};
use crate::queue_redis::{self, RedisQueueExecutor};
use crate::routes::router;
use crate::state::{self, build_state, Background};

/// Serves websockets and the HTTP API until ctrl-c.
pub async fn serve(
    config: ServerConfig,
    registry: SignalRegistry,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let (state, background) = build_state(&config, registry, metrics).await?;
    let router = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tideline listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    drop(background);
    info!("graceful shutdown complete");
    Ok(())
}

/// Runs handlers queued in Redis by the server processes. Pushes made by
/// the handlers travel back over the relay channel.
pub async fn work(
    config: ServerConfig,
    registry: SignalRegistry,
    queues: Vec<String>,
    poll_interval: Duration,
    worker_id: String,
) -> Result<()> {
    if config.queue_backend != Backend::Redis {
        bail!("the worker consumes redis queues; set --queue-backend redis");
    }
    if config.topic_backend == Backend::Memory {
        warn!("worker uses an in-memory topic cache; topic targets will find no subscribers");
    }
    let queues = if queues.is_empty() {
        registry.expected_queues().into_iter().collect()
    } else {
        queues
    };

    let mut background = Background::default();
    let topics = state::build_topics(&config, &mut background).await?;
    let delivery = state::connect_relay(&config, &mut background).await?;
    let queue = RedisQueueExecutor::connect(config.redis_url()?, &config.redis_prefix)
        .await
        .context("failed to connect job queue to redis")?
        .claimed_by(worker_id);

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(queue.clone()),
        delivery,
        topics,
    );
    let pool = WorkerPool::new(JobRunner::new(dispatcher), config.pool.clone());

    queue_redis::run_worker(queue, queues, pool, poll_interval, shutdown_signal()).await;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "worker draining running jobs"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    drop(background);
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
