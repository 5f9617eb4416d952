//! CLI argument parsing with clap derive.
//!
//! Flag names are deliberately camelCase; they predate this binary and are
//! part of the deployment surface.

use std::path::PathBuf;
use std::str::FromStr;

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use tracing::Level;

/// Git-driven declarative container orchestrator for a single host
#[derive(Debug, Parser)]
#[command(name = "lifebuoy-server", version)]
pub struct Cli {
    /// Owner of the GitHub repository used for configuration
    #[arg(long = "confRepositoryOwner", value_parser = NonEmptyStringValueParser::new())]
    pub conf_repository_owner: String,

    /// Name of the GitHub repository used for configuration
    #[arg(long = "confRepositoryName", value_parser = NonEmptyStringValueParser::new())]
    pub conf_repository_name: String,

    /// Revision of the configuration repository. By default the default
    /// branch head
    #[arg(long = "confRepositoryRevision")]
    pub conf_repository_revision: Option<String>,

    /// Token used for fetching the configuration repository from GitHub
    #[arg(long = "githubToken", env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Directory where Lifebuoy stores downloaded configuration and build
    /// contexts
    #[arg(long = "managedStoragePath", default_value = "tmp")]
    pub managed_storage_path: PathBuf,

    /// Prefix for engine resources (image names, container names, label
    /// namespaces)
    #[arg(long = "resourcePrefix", default_value = "dev.lifebuoy.")]
    pub resource_prefix: String,

    /// Log level (DEBUG|INFO|WARN|ERROR); RUST_LOG overrides it when set
    #[arg(long = "logLevel", default_value = "INFO", value_parser = parse_log_level)]
    pub log_level: Level,

    /// Seconds between configuration repository polls. Keep above the
    /// fetcher backend's unauthenticated rate budget
    #[arg(long = "confPollIntervalSeconds", default_value_t = 60)]
    pub conf_poll_interval_seconds: u64,

    /// Number of image builds allowed to run concurrently
    #[arg(long = "buildPoolSize", default_value_t = 1)]
    pub build_pool_size: usize,
}

impl Cli {
    /// Revision with the empty string normalized away, so `""` behaves like
    /// an absent flag.
    #[must_use]
    pub fn repository_revision(&self) -> Option<&str> {
        self.conf_repository_revision
            .as_deref()
            .filter(|revision| !revision.is_empty())
    }

    /// Token with the empty string normalized away.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.github_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }
}

fn parse_log_level(raw: &str) -> Result<Level, String> {
    Level::from_str(raw).map_err(|_| {
        format!("`{raw}` is not a log level (expected DEBUG, INFO, WARN or ERROR)")
    })
}
