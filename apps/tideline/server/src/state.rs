use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tideline_core::{
    ContextPipeline, Delivery, Dispatcher, JobRunner, LocalExecutor, MemoryTopicCache,
    QueueExecutor, SignalRegistry, SignedUserStep, TopicCache, UserTokenSigner, WorkerPool,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache_redis::RedisTopicCache;
use crate::config::{Backend, ServerConfig};
use crate::multiplexer::{ConnectionMultiplexer, MultiplexerConfig};
use crate::queue_redis::RedisQueueExecutor;
use crate::relay::{self, RedisRelay};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub multiplexer: ConnectionMultiplexer,
    pub pipeline: ContextPipeline,
    pub topic_ttl: Duration,
    pub api_token: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

/// Tasks that live as long as the server. Dropping it stops them.
#[derive(Default)]
pub struct Background {
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub async fn build_state(
    config: &ServerConfig,
    registry: SignalRegistry,
    metrics: Option<PrometheusHandle>,
) -> Result<(Arc<AppState>, Background)> {
    let mut background = Background::default();
    let registry = Arc::new(registry);
    let topics = build_topics(config, &mut background).await?;

    let multiplexer = ConnectionMultiplexer::new(
        topics.clone(),
        MultiplexerConfig {
            per_connection_buffer: config.channel_depth,
            idle_timeout: config.idle_timeout,
            ..MultiplexerConfig::default()
        },
    );
    if let Some(recycler) = multiplexer.spawn_recycler() {
        background.push(recycler);
    }

    let dispatcher = match config.queue_backend {
        Backend::Memory => {
            let (executor, jobs) = LocalExecutor::channel();
            let dispatcher = Dispatcher::new(
                registry,
                Arc::new(executor),
                Arc::new(multiplexer.clone()),
                topics,
            );
            let pool = WorkerPool::new(JobRunner::new(dispatcher.clone()), config.pool.clone());
            background.push(pool.spawn(jobs));
            dispatcher
        }
        Backend::Redis => {
            let url = config.redis_url()?;
            let executor = connect_queue(config).await?;
            let delivery = connect_relay(config, &mut background).await?;
            background.push(
                relay::spawn_listener(url, &config.redis_prefix, multiplexer.clone()).await?,
            );
            Dispatcher::new(registry, executor, delivery, topics)
        }
    };

    info!(
        topic_backend = ?config.topic_backend,
        queue_backend = ?config.queue_backend,
        signals = dispatcher.registry().len(),
        "application state ready"
    );

    let state = Arc::new(AppState {
        dispatcher,
        multiplexer,
        pipeline: build_pipeline(config),
        topic_ttl: config.topic_ttl,
        api_token: config.api_token.clone(),
        metrics,
    });
    Ok((state, background))
}

pub fn build_pipeline(config: &ServerConfig) -> ContextPipeline {
    let pipeline = ContextPipeline::standard().with_default_locale(config.default_locale.clone());
    match &config.user_token_secret {
        Some(secret) => {
            let step = SignedUserStep::new(UserTokenSigner::new(secret.as_bytes()));
            if config.require_user {
                pipeline.with_step(step.required())
            } else {
                pipeline.with_step(step)
            }
        }
        None => pipeline,
    }
}

pub async fn build_topics(
    config: &ServerConfig,
    background: &mut Background,
) -> Result<Arc<dyn TopicCache>> {
    match config.topic_backend {
        Backend::Memory => {
            let cache = MemoryTopicCache::new();
            background.push(cache.spawn_sweeper(config.sweep_interval));
            Ok(Arc::new(cache))
        }
        Backend::Redis => {
            let cache = RedisTopicCache::connect(config.redis_url()?, &config.redis_prefix)
                .await
                .context("failed to connect topic cache to redis")?;
            Ok(Arc::new(cache))
        }
    }
}

pub async fn connect_queue(config: &ServerConfig) -> Result<Arc<dyn QueueExecutor>> {
    let queue = RedisQueueExecutor::connect(config.redis_url()?, &config.redis_prefix)
        .await
        .context("failed to connect job queue to redis")?;
    Ok(Arc::new(queue))
}

pub async fn connect_relay(
    config: &ServerConfig,
    background: &mut Background,
) -> Result<Arc<dyn Delivery>> {
    let client =
        redis::Client::open(config.redis_url()?).context("failed to create redis client")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("failed to connect relay publisher to redis")?;
    let (relay, publisher) = RedisRelay::spawn(manager, &config.redis_prefix);
    background.push(publisher);
    Ok(Arc::new(relay))
}
