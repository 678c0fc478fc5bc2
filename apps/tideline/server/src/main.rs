use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tideline_server::config::{Cli, Command, ServerConfig};
use tideline_server::{app, signals, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let command = cli.command.take().unwrap_or(Command::Serve);
    let service = match command {
        Command::Serve => "tideline-server",
        Command::Worker { .. } => "tideline-worker",
    };
    let telemetry = telemetry::Telemetry::init(service)?;

    let config = ServerConfig::try_from(cli)?;
    let registry = signals::default_registry()?;

    match command {
        Command::Serve => {
            info!(
                listen_addr = %config.listen_addr,
                topic_backend = ?config.topic_backend,
                queue_backend = ?config.queue_backend,
                "starting tideline server"
            );
            app::serve(config, registry, Some(telemetry.metrics_handle())).await
        }
        Command::Worker {
            queues,
            poll_ms,
            worker_id,
        } => {
            info!(queues = ?queues, worker_id = %worker_id, "starting tideline worker");
            app::work(
                config,
                registry,
                queues,
                Duration::from_millis(poll_ms),
                worker_id,
            )
            .await
        }
    }
}
