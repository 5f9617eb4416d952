//! Configuration manager — polls the config repository and publishes the
//! desired app set.
//!
//! Every iteration is all-or-nothing: one malformed file aborts the whole
//! check and the previously-published set stays in force. The loop itself
//! never dies; each error path logs and waits for the next tick.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::apps::App;
use crate::container::ContainerManagerHandle;
use crate::github::RepositoryFetcher;

/// Default poll interval. Must stay above the fetcher backend's
/// unauthenticated rate budget (60 requests/hour for GitHub).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default budget for one configuration check, network included.
pub const DEFAULT_ITER_TIMEOUT: Duration = Duration::from_secs(10);

const DOWNLOAD_DIR: &str = "configuration";
const APPS_DIR: &str = "apps";

/// Coordinates of the configuration repository.
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    pub owner: String,
    pub name: String,
    /// `None` means the default branch head.
    pub revision: Option<String>,
    pub token: Option<String>,
}

// ── Config documents ─────────────────────────────────────────────────────────

/// One app declaration, one YAML file under `configuration/apps/`. The file
/// stem is the app name.
#[derive(Debug, Deserialize)]
struct AppDocument {
    version: u32,
    #[serde(with = "serde_yaml::with::singleton_map")]
    source: AppSource,
}

/// Where an app's source lives. A single variant today; the enum is the
/// extension point for future source kinds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AppSource {
    Github(GithubSource),
}

#[derive(Debug, Deserialize)]
struct GithubSource {
    owner: String,
    repository: String,
    revision: String,
}

/// Validation failures for the configuration tree. Any one of these aborts
/// the whole iteration; there are no partial publications.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read configuration file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode configuration file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("unsupported configuration version {version} in {path} (expected 1)")]
    UnsupportedVersion { version: u32, path: PathBuf },

    #[error("missing or empty field `{field}` in {path}")]
    EmptyField {
        field: &'static str,
        path: PathBuf,
    },

    #[error("configuration file {path} has no usable file stem")]
    InvalidFileName { path: PathBuf },

    #[error("multiple apps share the same name: {}", names.join(", "))]
    DuplicateNames { names: Vec<String> },
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct ConfigurationManager {
    fetcher: Arc<dyn RepositoryFetcher>,
    repository: ConfigRepository,
    storage_path: PathBuf,
    resource_prefix: String,
    containers: ContainerManagerHandle,
    poll_interval: Duration,
    iter_timeout: Duration,
    last_hash: Option<String>,
    published: Option<Vec<App>>,
}

impl ConfigurationManager {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn RepositoryFetcher>,
        repository: ConfigRepository,
        storage_path: &Path,
        resource_prefix: &str,
        containers: ContainerManagerHandle,
    ) -> Self {
        Self {
            fetcher,
            repository,
            storage_path: storage_path.to_path_buf(),
            resource_prefix: resource_prefix.to_string(),
            containers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            iter_timeout: DEFAULT_ITER_TIMEOUT,
            last_hash: None,
            published: None,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_iter_timeout(mut self, iter_timeout: Duration) -> Self {
        self.iter_timeout = iter_timeout;
        self
    }

    /// Run the poll loop: one check immediately, then one per tick, forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_for_changes().await;
        }
    }

    /// One timeout-scoped configuration check.
    async fn check_for_changes(&mut self) {
        tracing::debug!("configuration check started");
        let iter_timeout = self.iter_timeout;
        if tokio::time::timeout(iter_timeout, self.check_once())
            .await
            .is_err()
        {
            // The iteration may have died anywhere, possibly after updating
            // the hash; drop it so the next tick starts from scratch.
            tracing::warn!(
                timeout_secs = iter_timeout.as_secs(),
                "configuration check timed out"
            );
            self.last_hash = None;
        }
        tracing::debug!("configuration check finished");
    }

    async fn check_once(&mut self) {
        let repo = self.repository.clone();
        let hash = match self
            .fetcher
            .revision_hash(
                &repo.owner,
                &repo.name,
                repo.revision.as_deref(),
                repo.token.as_deref(),
            )
            .await
        {
            Ok(hash) => hash,
            Err(error) => {
                tracing::error!(error = %error, "failed to resolve configuration revision");
                return;
            }
        };

        if self.last_hash.as_deref() == Some(hash.as_str()) {
            tracing::debug!("configuration revision unchanged");
            return;
        }
        self.last_hash = Some(hash);

        let config_dir = self.storage_path.join(DOWNLOAD_DIR);
        // Materialize a clean tree: extraction over leftovers would keep
        // files that were deleted upstream.
        if let Err(error) = std::fs::remove_dir_all(&config_dir) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(error = %error, "failed to clear configuration directory");
                self.last_hash = None;
                return;
            }
        }
        if let Err(error) = self
            .fetcher
            .download(
                &repo.owner,
                &repo.name,
                repo.revision.as_deref(),
                repo.token.as_deref(),
                &config_dir,
            )
            .await
        {
            tracing::error!(error = %error, "failed to download configuration repository");
            // Without this the manager would wedge until the upstream hash
            // moves again.
            self.last_hash = None;
            return;
        }

        let mut apps = match read_app_configurations(
            &config_dir.join(APPS_DIR),
            &self.resource_prefix,
        ) {
            Ok(apps) => apps,
            Err(error) => {
                tracing::error!(error = %error, "invalid configuration");
                self.last_hash = None;
                return;
            }
        };
        apps.extend(default_apps(&self.resource_prefix));

        if let Err(error) = check_name_collisions(&apps) {
            tracing::error!(error = %error, "invalid configuration");
            self.last_hash = None;
            return;
        }

        if self.published.as_ref() == Some(&apps) {
            tracing::debug!("apps configuration unchanged");
            return;
        }

        tracing::info!(apps = apps.len(), "apps configuration changed");
        if let Err(error) = self.containers.update_apps(apps.clone()).await {
            tracing::error!(error = %error, "failed to publish apps");
            self.last_hash = None;
            return;
        }
        self.published = Some(apps);
    }
}

// ── Pure pieces ──────────────────────────────────────────────────────────────

/// Read, decode, and validate every regular file under `dir`, in file-name
/// order so the resulting app sequence is deterministic.
fn read_app_configurations(dir: &Path, resource_prefix: &str) -> Result<Vec<App>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let is_file = entry
            .file_type()
            .map_err(|source| ConfigError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?
            .is_file();
        if is_file {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut apps = Vec::with_capacity(paths.len());
    for path in paths {
        apps.push(read_app_configuration(&path, resource_prefix)?);
    }
    Ok(apps)
}

fn read_app_configuration(path: &Path, resource_prefix: &str) -> Result<App, ConfigError> {
    let app_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| ConfigError::InvalidFileName {
            path: path.to_path_buf(),
        })?
        .to_string();

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let document: AppDocument =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    if document.version != 1 {
        return Err(ConfigError::UnsupportedVersion {
            version: document.version,
            path: path.to_path_buf(),
        });
    }

    let AppSource::Github(source) = document.source;
    for (field, value) in [
        ("source.github.owner", &source.owner),
        ("source.github.repository", &source.repository),
        ("source.github.revision", &source.revision),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field,
                path: path.to_path_buf(),
            });
        }
    }

    Ok(App::repo_build(
        resource_prefix,
        &app_name,
        &source.owner,
        &source.repository,
        &source.revision,
    ))
}

fn check_name_collisions(apps: &[App]) -> Result<(), ConfigError> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for app in apps {
        *counts.entry(app.name()).or_default() += 1;
    }
    let names: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();
    if names.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::DuplicateNames { names })
    }
}

/// The bundled ingress proxy, always appended to the desired set. Its
/// provider config lets it discover the other managed containers.
const TRAEFIK_DOCKERFILE: &str = "FROM traefik:v3.1.0\n\
RUN mkdir /etc/traefik\n\
RUN echo \"providers: {'docker': {}}\" > /etc/traefik/traefik.yml\n";

pub const DEFAULT_INGRESS_APP: &str = "internal.traefik";

fn default_apps(resource_prefix: &str) -> Vec<App> {
    vec![App::inline_dockerfile(
        resource_prefix,
        DEFAULT_INGRESS_APP,
        TRAEFIK_DOCKERFILE,
    )]
}
