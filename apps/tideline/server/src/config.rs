use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tideline_core::PoolConfig;

#[derive(Debug, Parser)]
#[command(
    name = "tideline-server",
    author,
    version,
    about = "Tideline signal server and background worker"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to bind the HTTP and websocket listener to.
    #[arg(
        long,
        env = "TIDELINE_LISTEN_ADDR",
        default_value = "127.0.0.1:8420",
        global = true
    )]
    pub listen_addr: String,

    /// Redis connection URI, required by the redis backends.
    #[arg(long, env = "TIDELINE_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Prefix of every Redis key and channel.
    #[arg(long, env = "TIDELINE_REDIS_PREFIX", default_value = "tideline", global = true)]
    pub redis_prefix: String,

    /// Where topic subscriptions live.
    #[arg(long, env = "TIDELINE_TOPIC_BACKEND", value_enum, default_value_t = Backend::Memory, global = true)]
    pub topic_backend: Backend,

    /// Where handler jobs are queued.
    #[arg(long, env = "TIDELINE_QUEUE_BACKEND", value_enum, default_value_t = Backend::Memory, global = true)]
    pub queue_backend: Backend,

    /// Lifetime of a topic subscription without activity.
    #[arg(long, env = "TIDELINE_TOPIC_TTL_SECS", default_value_t = 36_000, global = true)]
    pub topic_ttl_secs: u64,

    /// Concurrent jobs per queue.
    #[arg(long, env = "TIDELINE_POOL_SIZE", default_value_t = 10, global = true)]
    pub pool_size: usize,

    /// Secret for verifying user tokens. Connections are anonymous without it.
    #[arg(long, env = "TIDELINE_USER_TOKEN_SECRET", global = true)]
    pub user_token_secret: Option<String>,

    /// Reject websocket connections without a valid user token.
    #[arg(long, env = "TIDELINE_REQUIRE_USER", default_value_t = false, global = true)]
    pub require_user: bool,

    /// Bearer token protecting the trigger and topic endpoints.
    #[arg(long, env = "TIDELINE_API_TOKEN", global = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "TIDELINE_DEFAULT_LOCALE", default_value = "en", global = true)]
    pub default_locale: String,

    /// Outbound frames buffered per connection before pushes are dropped.
    #[arg(long, env = "TIDELINE_CHANNEL_DEPTH", default_value_t = 64, global = true)]
    pub channel_depth: usize,

    /// Close connections silent for this long. Zero disables the recycler.
    #[arg(long, env = "TIDELINE_IDLE_TIMEOUT_SECS", default_value_t = 0, global = true)]
    pub idle_timeout_secs: u64,

    /// Interval of the expired subscription sweep.
    #[arg(long, env = "TIDELINE_SWEEP_INTERVAL_SECS", default_value_t = 60, global = true)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDELINE_SHUTDOWN_GRACE_SECS", default_value_t = 5, global = true)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve websocket connections and the HTTP API (default).
    Serve,
    /// Run handler jobs from the redis queues.
    Worker {
        /// Queues to consume. Defaults to every queue the registry expects.
        #[arg(long = "queue")]
        queues: Vec<String>,

        /// Pause between polls when every queue is empty.
        #[arg(long, env = "TIDELINE_WORKER_POLL_MS", default_value_t = 250)]
        poll_ms: u64,

        /// Stable name of this worker. Jobs it claimed but never finished are
        /// requeued when a worker with the same name starts.
        #[arg(long, env = "TIDELINE_WORKER_ID", default_value = "worker")]
        worker_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub topic_backend: Backend,
    pub queue_backend: Backend,
    pub topic_ttl: Duration,
    pub pool: PoolConfig,
    pub user_token_secret: Option<String>,
    pub require_user: bool,
    pub api_token: Option<String>,
    pub default_locale: String,
    pub channel_depth: usize,
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8420)),
            redis_url: None,
            redis_prefix: "tideline".into(),
            topic_backend: Backend::Memory,
            queue_backend: Backend::Memory,
            topic_ttl: Duration::from_secs(36_000),
            pool: PoolConfig::default(),
            user_token_secret: None,
            require_user: false,
            api_token: None,
            default_locale: tideline_core::DEFAULT_LOCALE.into(),
            channel_depth: 64,
            idle_timeout: None,
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn redis_url(&self) -> anyhow::Result<&str> {
        self.redis_url
            .as_deref()
            .context("a redis backend is configured but TIDELINE_REDIS_URL is not set")
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let uses_redis = cli.topic_backend == Backend::Redis || cli.queue_backend == Backend::Redis;
        if uses_redis && cli.redis_url.is_none() {
            bail!("a redis backend is configured but TIDELINE_REDIS_URL is not set");
        }
        if cli.require_user && cli.user_token_secret.is_none() {
            bail!("TIDELINE_REQUIRE_USER needs TIDELINE_USER_TOKEN_SECRET");
        }
        if cli.channel_depth == 0 {
            bail!("channel depth must be positive");
        }
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            redis_prefix: cli.redis_prefix,
            topic_backend: cli.topic_backend,
            queue_backend: cli.queue_backend,
            topic_ttl: Duration::from_secs(cli.topic_ttl_secs.max(1)),
            pool: PoolConfig::default().with_default_size(cli.pool_size),
            user_token_secret: cli.user_token_secret,
            require_user: cli.require_user,
            api_token: cli.api_token,
            default_locale: cli.default_locale,
            channel_depth: cli.channel_depth,
            idle_timeout: (cli.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(cli.idle_timeout_secs)),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs.max(1)),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<(Option<Command>, ServerConfig)> {
        let mut cli = Cli::try_parse_from(std::iter::once("tideline-server").chain(args.iter().copied()))?;
        let command = cli.command.take();
        Ok((command, ServerConfig::try_from(cli)?))
    }

    #[test]
    fn defaults_serve_from_memory() {
        let (command, config) = parse(&[]).unwrap();
        assert!(command.is_none());
        assert_eq!(config.topic_backend, Backend::Memory);
        assert_eq!(config.topic_ttl, Duration::from_secs(36_000));
        assert_eq!(config.pool.size_for("anything"), 10);
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn worker_accepts_queues() {
        let (command, config) = parse(&[
            "worker",
            "--queue",
            "fast",
            "--queue",
            "slow",
            "--queue-backend",
            "redis",
            "--redis-url",
            "redis://127.0.0.1/",
        ])
        .unwrap();
        match command {
            Some(Command::Worker {
                queues, worker_id, ..
            }) => {
                assert_eq!(queues, vec!["fast", "slow"]);
                assert_eq!(worker_id, "worker");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(config.queue_backend, Backend::Redis);
    }

    #[test]
    fn redis_backends_need_a_url() {
        assert!(parse(&["--topic-backend", "redis"]).is_err());
        assert!(parse(&["--listen-addr", "nowhere"]).is_err());
        assert!(parse(&["--require-user"]).is_err());
    }
}
