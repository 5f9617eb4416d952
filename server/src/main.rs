//! Lifebuoy server entry point.
//!
//! Initialises tracing, probes the container engine, wires the configuration
//! manager to the container manager, and parks on ctrl-c. Startup failures
//! (missing flags, unreachable engine) exit non-zero; once the loops are
//! running, per-iteration failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lifebuoy_server::cli::Cli;
use lifebuoy_server::command_runner::{TokioCommandRunner, DEFAULT_CMD_TIMEOUT};
use lifebuoy_server::configuration::{ConfigRepository, ConfigurationManager};
use lifebuoy_server::container::ContainerManager;
use lifebuoy_server::docker::{CliDocker, Docker};
use lifebuoy_server::github::{GithubFetcher, RepositoryFetcher};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string())),
        )
        .init();

    tokio::select! {
        result = run(cli) => {
            if let Err(error) = result {
                tracing::error!(error = %format!("{error:#}"), "startup failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.managed_storage_path).with_context(|| {
        format!(
            "creating storage directory {}",
            cli.managed_storage_path.display()
        )
    })?;

    let runner = TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT);
    let docker: Arc<dyn Docker> = Arc::new(CliDocker::new(runner, cli.resource_prefix.clone()));
    let engine_version = docker.ping().await.context("container engine is unreachable")?;
    tracing::info!(engine_version = %engine_version, "connected to container engine");

    let fetcher: Arc<dyn RepositoryFetcher> =
        Arc::new(GithubFetcher::new().context("building GitHub client")?);

    let (container_manager, handle) = ContainerManager::new(
        docker,
        fetcher.clone(),
        &cli.managed_storage_path,
        cli.build_pool_size,
    );

    let repository = ConfigRepository {
        owner: cli.conf_repository_owner.clone(),
        name: cli.conf_repository_name.clone(),
        revision: cli.repository_revision().map(ToString::to_string),
        token: cli.token().map(ToString::to_string),
    };
    let configuration_manager = ConfigurationManager::new(
        fetcher,
        repository,
        &cli.managed_storage_path,
        &cli.resource_prefix,
        handle,
    )
    .with_poll_interval(Duration::from_secs(cli.conf_poll_interval_seconds));

    tracing::info!(
        repository = %format!("{}/{}", cli.conf_repository_owner, cli.conf_repository_name),
        storage = %cli.managed_storage_path.display(),
        prefix = %cli.resource_prefix,
        "lifebuoy starting"
    );

    tokio::spawn(container_manager.run());
    configuration_manager.run().await;
    Ok(())
}
