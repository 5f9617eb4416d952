//! Repository fetcher — resolves revisions and downloads source trees.
//!
//! The GitHub implementation uses two endpoints: the commits API with
//! `Accept: application/vnd.github.sha` (the response body is the bare hash,
//! a cheap change detector) and the tarball API. Tarballs arrive gzipped
//! with a single synthetic top-level directory, which is stripped during
//! extraction.
//!
//! Nothing here retries; failures are transient-by-default and the polling
//! loops decide what to do.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;

/// Fetches remote repository metadata and source trees.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Resolve `revision` (or the default branch head) to a stable content
    /// hash.
    async fn revision_hash(
        &self,
        owner: &str,
        repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<String>;

    /// Download the tree at `revision` (or the default branch head) into
    /// `dest`, creating directories as needed and preserving file modes.
    async fn download(
        &self,
        owner: &str,
        repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<()>;
}

/// Production fetcher against the GitHub REST API.
pub struct GithubFetcher {
    client: reqwest::Client,
    base_url: String,
}

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("lifebuoy/", env!("CARGO_PKG_VERSION"));

impl GithubFetcher {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self> {
        Self::with_base_url(GITHUB_API_BASE)
    }

    /// Construct against a non-default API base (used in tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get(&self, url: &str, accept: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url).header("Accept", accept);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{url} returned {status}");
        }
        Ok(response)
    }
}

#[async_trait]
impl RepositoryFetcher for GithubFetcher {
    async fn revision_hash(
        &self,
        owner: &str,
        repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<String> {
        let url = commits_url(&self.base_url, owner, repo, revision);
        let response = self
            .get(&url, "application/vnd.github.sha", token)
            .await?;
        let hash = response.text().await.context("reading revision hash")?;
        Ok(hash.trim().to_string())
    }

    async fn download(
        &self,
        owner: &str,
        repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let url = tarball_url(&self.base_url, owner, repo, revision);
        let response = self.get(&url, "application/vnd.github+json", token).await?;
        let body = response.bytes().await.context("downloading tarball")?;
        extract_tarball(&body, dest)
            .with_context(|| format!("extracting tarball into {}", dest.display()))
    }
}

fn commits_url(base: &str, owner: &str, repo: &str, revision: Option<&str>) -> String {
    format!(
        "{base}/repos/{owner}/{repo}/commits/{}",
        revision.unwrap_or("HEAD")
    )
}

fn tarball_url(base: &str, owner: &str, repo: &str, revision: Option<&str>) -> String {
    match revision {
        Some(revision) => format!("{base}/repos/{owner}/{repo}/tarball/{revision}"),
        None => format!("{base}/repos/{owner}/{repo}/tarball"),
    }
}

/// Extract a gzipped tarball into `dest`, stripping the single leading
/// directory every GitHub tarball carries.
///
/// Regular files keep their mode bits; directories are created as needed;
/// other entry types (symlinks, devices) are skipped. Entries with absolute
/// paths or `..` components are rejected outright.
fn extract_tarball(bytes: &[u8], dest: &Path) -> Result<()> {
    let gz = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries().context("reading tarball entries")? {
        let mut entry = entry.context("reading tarball entry")?;
        let path = entry.path().context("reading tarball entry path")?.into_owned();
        validate_entry_path(&path)?;

        let Some(stripped) = strip_leading_dir(&path) else {
            continue;
        };
        let target = dest.join(stripped);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let mut content = Vec::new();
                entry
                    .read_to_end(&mut content)
                    .with_context(|| format!("reading {}", path.display()))?;
                std::fs::write(&target, &content)
                    .with_context(|| format!("writing {}", target.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = entry.header().mode().context("reading entry mode")?;
                    std::fs::set_permissions(
                        &target,
                        std::fs::Permissions::from_mode(mode & 0o777),
                    )
                    .with_context(|| format!("setting permissions on {}", target.display()))?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Reject absolute paths and `..` components before anything touches disk.
fn validate_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        bail!("tarball contains an absolute path entry: {}", path.display());
    }
    for component in path.components() {
        if component == Component::ParentDir {
            bail!(
                "tarball contains a path traversal entry: {}",
                path.display()
            );
        }
    }
    Ok(())
}

/// Drop the synthetic `<owner>-<repo>-<hash>/` directory GitHub prepends.
/// Returns `None` for the top-level directory entry itself.
fn strip_leading_dir(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

// ── Test double ──────────────────────────────────────────────────────────────
