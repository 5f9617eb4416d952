//! Container-engine adapter.
//!
//! [`Docker`] abstracts the local engine so the reconciler and the app
//! capabilities are testable without a daemon. The production implementation
//! drives the `docker` binary through the [`CommandRunner`] port; list
//! queries use `--format {{json .}}` and are parsed line by line.
//!
//! Every object Lifebuoy owns carries the label `<prefix>managed=true`;
//! containers additionally carry `<prefix>app-name=<name>`. List queries
//! filter on the managed label, so objects created out of band are invisible
//! here.

use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::command_runner::{CommandRunner, DEFAULT_BUILD_TIMEOUT, DEFAULT_CMD_TIMEOUT};

/// Minimal image descriptor, as reported by `docker image ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub repository: String,
    pub tag: String,
}

/// Minimal container descriptor, as reported by `docker ps`.
///
/// `app_name` is the value of the `<prefix>app-name` label when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub state: String,
    pub app_name: Option<String>,
}

/// Filter set for container list queries.
///
/// The managed label is always applied on top of these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerQuery {
    /// Exact container name (anchored; the engine's name filter is a
    /// substring match by default).
    pub name: Option<String>,
    /// Image the container was created from.
    pub ancestor: Option<String>,
    /// Restrict to running containers.
    pub running_only: bool,
    /// Include stopped and exited containers.
    pub include_stopped: bool,
}

/// A build context: a directory on disk or an in-memory tar stream that
/// contains a `Dockerfile`.
#[derive(Debug)]
pub enum BuildContext<'a> {
    Directory(&'a Path),
    Tarball(&'a [u8]),
}

/// Parameters for container creation. Struct-based so test doubles don't
/// break when a field is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec<'a> {
    pub image: &'a str,
    pub name: &'a str,
    pub app_name: &'a str,
    /// In-container mount points, passed as anonymous volumes.
    pub volumes: &'a [String],
}

/// Typed wrapper over the local container engine.
///
/// Build and create are non-idempotent on the engine side; callers pre-check
/// existence via the list queries.
#[async_trait]
pub trait Docker: Send + Sync {
    /// Verify the engine is reachable; returns its server version.
    async fn ping(&self) -> Result<String>;

    /// List managed images matching `reference`.
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>>;

    /// List managed containers matching `query`.
    async fn list_containers(&self, query: &ContainerQuery) -> Result<Vec<ContainerSummary>>;

    /// Build `image_ref` from the given context, labelling it as managed.
    async fn build_image(&self, image_ref: &str, context: BuildContext<'_>) -> Result<()>;

    /// Create a container with the managed and app-name labels applied.
    async fn create_container(&self, spec: ContainerSpec<'_>) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;
}

/// Production adapter — shells out to the `docker` CLI.
pub struct CliDocker<R: CommandRunner> {
    runner: R,
    resource_prefix: String,
    cmd_timeout: Duration,
    build_timeout: Duration,
}

impl<R: CommandRunner> CliDocker<R> {
    #[must_use]
    pub fn new(runner: R, resource_prefix: impl Into<String>) -> Self {
        Self {
            runner,
            resource_prefix: resource_prefix.into(),
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    fn managed_label(&self) -> String {
        format!("{}managed", self.resource_prefix)
    }

    fn app_name_label(&self) -> String {
        format!("{}app-name", self.resource_prefix)
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_with_timeout("docker", &argv, self.cmd_timeout)
            .await?;
        if !output.status.success() {
            bail!(
                "docker {} failed: {}",
                argv.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

#[async_trait]
impl<R: CommandRunner> Docker for CliDocker<R> {
    async fn ping(&self) -> Result<String> {
        let output = self
            .docker(&to_args(["version", "--format", "{{.Server.Version}}"]))
            .await
            .context("is the docker daemon running?")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        let args = to_args([
            "image",
            "ls",
            "--filter",
            &format!("reference={reference}"),
            "--filter",
            &format!("label={}=true", self.managed_label()),
            "--format",
            "{{json .}}",
        ]);
        let output = self.docker(&args).await?;
        parse_image_lines(&String::from_utf8_lossy(&output.stdout))
    }

    async fn list_containers(&self, query: &ContainerQuery) -> Result<Vec<ContainerSummary>> {
        let mut args = to_args(["ps", "--no-trunc"]);
        if query.include_stopped {
            args.push("--all".to_string());
        }
        args.push("--filter".to_string());
        args.push(format!("label={}=true", self.managed_label()));
        if let Some(name) = &query.name {
            args.push("--filter".to_string());
            args.push(format!("name=^{name}$"));
        }
        if let Some(ancestor) = &query.ancestor {
            args.push("--filter".to_string());
            args.push(format!("ancestor={ancestor}"));
        }
        if query.running_only {
            args.push("--filter".to_string());
            args.push("status=running".to_string());
        }
        args.push("--format".to_string());
        args.push("{{json .}}".to_string());

        let output = self.docker(&args).await?;
        parse_container_lines(&String::from_utf8_lossy(&output.stdout), &self.app_name_label())
    }

    async fn build_image(&self, image_ref: &str, context: BuildContext<'_>) -> Result<()> {
        let label = format!("{}=true", self.managed_label());
        let output = match context {
            BuildContext::Directory(dir) => {
                let dir = dir.to_string_lossy();
                let argv = ["build", dir.as_ref(), "--tag", image_ref, "--label", label.as_str()];
                self.runner
                    .run_with_timeout("docker", &argv, self.build_timeout)
                    .await?
            }
            BuildContext::Tarball(bytes) => {
                let argv = ["build", "-", "--tag", image_ref, "--label", label.as_str()];
                self.runner
                    .run_with_stdin("docker", &argv, bytes, self.build_timeout)
                    .await?
            }
        };
        if !output.status.success() {
            bail!(
                "image build for {image_ref} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        tracing::debug!(image = image_ref, "image build finished");
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec<'_>) -> Result<()> {
        let mut args = to_args([
            "container",
            "create",
            "--label",
            &format!("{}=true", self.managed_label()),
            "--label",
            &format!("{}={}", self.app_name_label(), spec.app_name),
        ]);
        for mount_point in spec.volumes {
            args.push("--volume".to_string());
            args.push(mount_point.clone());
        }
        args.push("--name".to_string());
        args.push(spec.name.to_string());
        args.push(spec.image.to_string());

        self.docker(&args).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker(&to_args(["container", "start", name])).await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.docker(&to_args(["container", "stop", name])).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker(&to_args(["container", "rm", name])).await?;
        Ok(())
    }
}

fn to_args<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

// ── Engine output parsing ────────────────────────────────────────────────────

/// One line of `docker image ls --format {{json .}}`.
#[derive(Debug, Deserialize)]
struct ImageLine {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

/// One line of `docker ps --format {{json .}}`.
#[derive(Debug, Deserialize)]
struct ContainerLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_image_lines(stdout: &str) -> Result<Vec<ImageSummary>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parsed: ImageLine =
                serde_json::from_str(line).context("parsing docker image ls output")?;
            Ok(ImageSummary {
                repository: parsed.repository,
                tag: parsed.tag,
            })
        })
        .collect()
}

fn parse_container_lines(stdout: &str, app_name_label: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parsed: ContainerLine =
                serde_json::from_str(line).context("parsing docker ps output")?;
            let labels = parse_labels(&parsed.labels);
            Ok(ContainerSummary {
                name: parsed.names,
                state: parsed.state,
                app_name: labels.get(app_name_label).cloned(),
            })
        })
        .collect()
}

/// Parse the engine's `k=v,k=v` label list.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

// ── Test double ──────────────────────────────────────────────────────────────
