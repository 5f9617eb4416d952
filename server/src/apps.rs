//! App abstraction — a declared unit of deployment.
//!
//! An [`App`] is an immutable value produced by the configuration manager.
//! Identity is content-derived: the image reference is a pure function of the
//! variant's content, and the container name is a pure function of the app
//! name and the image reference, so a content change forces a new container
//! identity.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::docker::{BuildContext, Docker};
use crate::github::RepositoryFetcher;

/// How an app's image comes to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppVariant {
    /// Built from a GitHub repository checkout at a fixed revision.
    RepoBuild {
        owner: String,
        repo: String,
        revision: String,
    },
    /// Built from an inline Dockerfile shipped with the configuration.
    InlineDockerfile { dockerfile: String },
}

/// A declared unit of deployment: name, how to build its image, and the
/// volumes its container mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    name: String,
    resource_prefix: String,
    volumes: Vec<String>,
    variant: AppVariant,
}

/// Shared handles a build job needs: the engine, the fetcher, and the scratch
/// root for build contexts.
pub struct BuildResources {
    pub docker: Arc<dyn Docker>,
    pub fetcher: Arc<dyn RepositoryFetcher>,
    /// Scratch root for build contexts (`<storage>/build`).
    pub build_dir: PathBuf,
}

impl App {
    #[must_use]
    pub fn repo_build(
        resource_prefix: &str,
        name: &str,
        owner: &str,
        repo: &str,
        revision: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            resource_prefix: resource_prefix.to_string(),
            volumes: Vec::new(),
            variant: AppVariant::RepoBuild {
                owner: owner.to_string(),
                repo: repo.to_string(),
                revision: revision.to_string(),
            },
        }
    }

    #[must_use]
    pub fn inline_dockerfile(resource_prefix: &str, name: &str, dockerfile: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_prefix: resource_prefix.to_string(),
            volumes: Vec::new(),
            variant: AppVariant::InlineDockerfile {
                dockerfile: dockerfile.to_string(),
            },
        }
    }

    #[must_use]
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    /// The tag component of the image reference: the revision for repo
    /// builds, the Dockerfile content hash for inline builds.
    fn image_tag(&self) -> String {
        match &self.variant {
            AppVariant::RepoBuild { revision, .. } => revision.clone(),
            AppVariant::InlineDockerfile { dockerfile } => sha256_hex(dockerfile.as_bytes()),
        }
    }

    /// Image reference, `<prefix><name>:<tag>`. Pure function of the
    /// variant's content: same content, same reference.
    #[must_use]
    pub fn image_ref(&self) -> String {
        format!("{}{}:{}", self.resource_prefix, self.name, self.image_tag())
    }

    /// Container name, `<prefix><name>_<tag>`. An image-content change
    /// therefore forces a new container identity.
    #[must_use]
    pub fn container_name(&self) -> String {
        format!("{}{}_{}", self.resource_prefix, self.name, self.image_tag())
    }

    /// Whether the image for this app already exists on the engine.
    ///
    /// List errors are logged and reported as "not built" so the caller
    /// queues a build and the next pass retries.
    pub async fn is_built(&self, docker: &dyn Docker) -> bool {
        match docker.list_images(&self.image_ref()).await {
            Ok(images) => !images.is_empty(),
            Err(error) => {
                tracing::error!(app = %self.name, error = %error, "failed to list images");
                false
            }
        }
    }

    /// Build this app's image. Safe to call repeatedly for the same
    /// reference; the engine treats a rebuild as a cache hit.
    pub async fn build(&self, resources: &BuildResources) -> Result<()> {
        match &self.variant {
            AppVariant::RepoBuild {
                owner,
                repo,
                revision,
            } => {
                let scratch = ScratchDir::new(resources.build_dir.join(&self.name));
                // App repositories are fetched unauthenticated; the config
                // token is reserved for the configuration repository.
                resources
                    .fetcher
                    .download(owner, repo, Some(revision), None, scratch.path())
                    .await
                    .with_context(|| format!("downloading {owner}/{repo}@{revision}"))?;
                tracing::info!(app = %self.name, image = %self.image_ref(), "building image");
                resources
                    .docker
                    .build_image(&self.image_ref(), BuildContext::Directory(scratch.path()))
                    .await
            }
            AppVariant::InlineDockerfile { dockerfile } => {
                let tarball = dockerfile_tarball(dockerfile)?;
                tracing::info!(app = %self.name, image = %self.image_ref(), "building image");
                resources
                    .docker
                    .build_image(&self.image_ref(), BuildContext::Tarball(&tarball))
                    .await
            }
        }
    }
}

/// Scratch directory removed on every exit path, including cancellation.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(path: PathBuf) -> Self {
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_dir_all(&self.0) {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.0.display(), error = %error, "failed to remove build dir");
            }
        }
    }
}

/// Assemble the single-entry tar stream for an inline Dockerfile: one entry
/// named `Dockerfile`, mode 0600, exact byte length.
fn dockerfile_tarball(dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o600);
    builder
        .append_data(&mut header, "Dockerfile", dockerfile.as_bytes())
        .context("writing Dockerfile tar entry")?;
    builder.into_inner().context("finishing Dockerfile tarball")
}

fn sha256_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for &byte in digest.iter() {
        out.push(char::from(HEX[(byte >> 4) as usize]));
        out.push(char::from(HEX[(byte & 0xf) as usize]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::FakeDocker;
    use crate::github::testing::FakeFetcher;
    use proptest::prelude::*;

    const PREFIX: &str = "dev.lifebuoy.";

    fn repo_app() -> App {
        App::repo_build(PREFIX, "a", "acme", "widgets", "r1")
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    #[test]
    fn test_repo_build_image_ref_uses_revision_tag() {
        assert_eq!(repo_app().image_ref(), "dev.lifebuoy.a:r1");
    }

    #[test]
    fn test_repo_build_container_name_joins_name_and_tag() {
        assert_eq!(repo_app().container_name(), "dev.lifebuoy.a_r1");
    }

    #[test]
    fn test_inline_dockerfile_image_ref_uses_content_hash() {
        let app = App::inline_dockerfile(PREFIX, "proxy", "FROM scratch\n");
        let same = App::inline_dockerfile(PREFIX, "proxy", "FROM scratch\n");
        let different = App::inline_dockerfile(PREFIX, "proxy", "FROM alpine\n");
        assert_eq!(app.image_ref(), same.image_ref());
        assert_ne!(app.image_ref(), different.image_ref());
        let tag = app.image_ref();
        let tag = tag.split(':').nth(1).expect("tag present");
        assert_eq!(tag.len(), 64, "sha256 hex tag");
    }

    #[test]
    fn test_revision_change_forces_new_container_identity() {
        let old = App::repo_build(PREFIX, "a", "acme", "widgets", "r1");
        let new = App::repo_build(PREFIX, "a", "acme", "widgets", "r3");
        assert_ne!(old.container_name(), new.container_name());
    }

    #[test]
    fn test_volumes_are_part_of_the_value() {
        let plain = repo_app();
        let with_data = repo_app().with_volumes(vec!["/data".to_string()]);
        assert_eq!(with_data.volumes(), ["/data".to_string()]);
        assert_ne!(plain, with_data);
    }

    #[test]
    fn test_apps_compare_by_value() {
        assert_eq!(repo_app(), repo_app());
        assert_ne!(
            repo_app(),
            App::repo_build(PREFIX, "a", "acme", "widgets", "r2")
        );
    }

    proptest! {
        /// The image reference is a pure function of the variant content.
        #[test]
        fn prop_image_ref_deterministic(dockerfile in ".{0,200}") {
            let first = App::inline_dockerfile(PREFIX, "x", &dockerfile).image_ref();
            let second = App::inline_dockerfile(PREFIX, "x", &dockerfile).image_ref();
            prop_assert_eq!(first, second);
        }
    }

    // ── Dockerfile tarball ───────────────────────────────────────────────────

    #[test]
    fn test_dockerfile_tarball_single_entry_mode_0600_exact_length() {
        let dockerfile = "FROM traefik:v3.1.0\n";
        let bytes = dockerfile_tarball(dockerfile).expect("tarball");

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().expect("entries");
        let entry = entries.next().expect("one entry").expect("readable");
        assert_eq!(
            entry.path().expect("path").to_string_lossy(),
            "Dockerfile"
        );
        assert_eq!(entry.header().mode().expect("mode"), 0o600);
        assert_eq!(entry.header().size().expect("size"), dockerfile.len() as u64);
        assert!(entries.next().is_none(), "exactly one entry");
    }

    // ── Capabilities against the fake engine ─────────────────────────────────

    #[tokio::test]
    async fn test_is_built_reflects_engine_images() {
        let docker = FakeDocker::new().with_image("dev.lifebuoy.a:r1");
        assert!(repo_app().is_built(&docker).await);
        assert!(
            !App::repo_build(PREFIX, "a", "acme", "widgets", "r2")
                .is_built(&docker)
                .await
        );
    }

    #[tokio::test]
    async fn test_inline_build_sends_tarball_to_engine() {
        let app = App::inline_dockerfile(PREFIX, "proxy", "FROM scratch\n");
        let docker = Arc::new(FakeDocker::new());
        let resources = BuildResources {
            docker: docker.clone(),
            fetcher: Arc::new(FakeFetcher::default()),
            build_dir: std::env::temp_dir(),
        };

        app.build(&resources).await.expect("build");

        assert!(app.is_built(docker.as_ref()).await);
        let contexts = docker.build_contexts.lock().unwrap();
        assert_eq!(contexts.len(), 1);
        assert!(matches!(
            contexts[0],
            crate::docker::testing::BuildInput::Tarball(_)
        ));
    }

    #[tokio::test]
    async fn test_repo_build_downloads_then_builds_and_cleans_scratch() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let docker = Arc::new(FakeDocker::new());
        let fetcher = Arc::new(FakeFetcher::default().with_file("Dockerfile", "FROM scratch\n"));
        let resources = BuildResources {
            docker: docker.clone(),
            fetcher: fetcher.clone(),
            build_dir: dir.path().to_path_buf(),
        };

        repo_app().build(&resources).await.expect("build");

        assert!(docker.mutation_log().contains(&"build dev.lifebuoy.a:r1".to_string()));
        assert!(
            !dir.path().join("a").exists(),
            "scratch build context must be removed"
        );
        let downloads = fetcher.downloads.lock().unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].revision.as_deref(), Some("r1"));
        assert_eq!(downloads[0].token, None, "app repos are fetched unauthenticated");
    }

    #[tokio::test]
    async fn test_repo_build_cleans_scratch_on_download_failure() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let docker = Arc::new(FakeDocker::new());
        let fetcher = Arc::new(FakeFetcher::default().failing_downloads());
        let resources = BuildResources {
            docker,
            fetcher,
            build_dir: dir.path().to_path_buf(),
        };

        let result = repo_app().build(&resources).await;

        assert!(result.is_err());
        assert!(!dir.path().join("a").exists());
    }
}
