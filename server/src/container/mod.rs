//! Container manager — owns the desired app set and drives reconciliation.
//!
//! The main loop consumes exactly one event per iteration: a desired-set
//! update, a tick, a build-finish notification, or the end of a running
//! reconcile pass. After each event it may spawn one reconciliation task; at
//! most one is ever in flight, so a burst of updates during a running pass
//! collapses into a single follow-up over the latest snapshot.

mod reconcile;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::apps::{App, BuildResources};
use crate::docker::Docker;
use crate::github::RepositoryFetcher;
use crate::queue::{unique_job_processor, JobFinishedEvent, JobSubmitter, UniqueJobProcessor};

use reconcile::ReconcilePass;

/// How often a reconcile pass runs when nothing else wakes the loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

const BUILD_DIR: &str = "build";

/// Handle given to the configuration manager for publishing desired sets.
#[derive(Clone)]
pub struct ContainerManagerHandle {
    apps_tx: mpsc::Sender<Vec<App>>,
}

impl ContainerManagerHandle {
    pub(crate) fn new(apps_tx: mpsc::Sender<Vec<App>>) -> Self {
        Self { apps_tx }
    }

    /// Publish a new desired app set. Blocks until the manager has taken it,
    /// so a publication is always observed before the next reconcile
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the container manager is no longer running.
    pub async fn update_apps(&self, apps: Vec<App>) -> Result<()> {
        self.apps_tx
            .send(apps)
            .await
            .map_err(|_| anyhow!("container manager is no longer running"))
    }
}

pub struct ContainerManager {
    docker: Arc<dyn Docker>,
    resources: Arc<BuildResources>,
    apps_rx: mpsc::Receiver<Vec<App>>,
    processor: UniqueJobProcessor,
    submitter: JobSubmitter,
    build_events: mpsc::Receiver<JobFinishedEvent>,
    tick_interval: Duration,
}

impl ContainerManager {
    /// Wire up a manager and its build processor.
    #[must_use]
    pub fn new(
        docker: Arc<dyn Docker>,
        fetcher: Arc<dyn RepositoryFetcher>,
        storage_path: &Path,
        build_pool_size: usize,
    ) -> (Self, ContainerManagerHandle) {
        let (apps_tx, apps_rx) = mpsc::channel(1);
        let (processor, submitter, build_events) = unique_job_processor(build_pool_size);
        let resources = Arc::new(BuildResources {
            docker: docker.clone(),
            fetcher,
            build_dir: storage_path.join(BUILD_DIR),
        });

        let manager = Self {
            docker,
            resources,
            apps_rx,
            processor,
            submitter,
            build_events,
            tick_interval: DEFAULT_TICK_INTERVAL,
        };
        (manager, ContainerManagerHandle::new(apps_tx))
    }

    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Run the event loop. Never returns in normal operation.
    pub async fn run(self) {
        let Self {
            docker,
            resources,
            mut apps_rx,
            processor,
            submitter,
            mut build_events,
            tick_interval,
        } = self;

        tokio::spawn(processor.run());

        let (reconcile_finished_tx, mut reconcile_finished_rx) = mpsc::channel::<()>(1);
        // None until the first publication; reconciliation must not run on an
        // unset desired state.
        let mut desired: Option<Arc<Vec<App>>> = None;
        let mut reconcile_running = false;

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + tick_interval, tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(apps) = apps_rx.recv() => {
                    tracing::debug!(apps = apps.len(), "desired apps updated");
                    desired = Some(Arc::new(apps));
                }
                _ = ticker.tick() => {}
                Some(event) = build_events.recv() => {
                    match &event.result {
                        Ok(()) => tracing::info!(app = %event.id, "build finished"),
                        Err(error) => tracing::error!(app = %event.id, error = %error, "build failed"),
                    }
                }
                Some(()) = reconcile_finished_rx.recv() => {
                    reconcile_running = false;
                    continue;
                }
            }

            let Some(apps) = desired.clone() else {
                continue;
            };
            if reconcile_running {
                continue;
            }
            reconcile_running = true;

            let pass = ReconcilePass::new(
                docker.clone(),
                submitter.clone(),
                resources.clone(),
                apps,
            );
            let finished = reconcile_finished_tx.clone();
            tokio::spawn(async move {
                pass.run().await;
                let _ = finished.send(()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::{FakeContainer, FakeDocker};
    use crate::github::testing::FakeFetcher;
    use tempfile::TempDir;

    const PREFIX: &str = "dev.lifebuoy.";

    struct Harness {
        docker: Arc<FakeDocker>,
        handle: ContainerManagerHandle,
        _storage: TempDir,
    }

    fn spawn_manager(docker: FakeDocker, tick: Duration) -> Harness {
        let storage = TempDir::new().expect("tempdir");
        let docker = Arc::new(docker);
        let fetcher = Arc::new(FakeFetcher::default().with_file("Dockerfile", "FROM scratch\n"));
        let (manager, handle) =
            ContainerManager::new(docker.clone(), fetcher, storage.path(), 1);
        tokio::spawn(manager.with_tick_interval(tick).run());
        Harness {
            docker,
            handle,
            _storage: storage,
        }
    }

    /// Poll until `condition` holds or a generous deadline passes.
    async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn container_states(docker: &FakeDocker) -> Vec<(String, String)> {
        docker
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|container| (container.name.clone(), container.state.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_no_reconcile_before_first_publication() {
        let harness = spawn_manager(FakeDocker::new(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            harness.docker.list_call_count(),
            0,
            "reconcile must not run on an unset desired state"
        );
    }

    #[tokio::test]
    async fn test_cold_start_builds_creates_and_starts_everything() {
        let harness = spawn_manager(FakeDocker::new(), Duration::from_secs(3600));
        let apps = vec![
            App::repo_build(PREFIX, "a", "acme", "widgets", "r1"),
            App::repo_build(PREFIX, "b", "acme", "gears", "r2"),
        ];

        harness.handle.update_apps(apps).await.expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || {
                let states = container_states(&docker);
                states.len() == 2
                    && states
                        .iter()
                        .all(|(_, state)| state == "running")
            },
            "both containers running",
        )
        .await;

        let states = container_states(&harness.docker);
        let names: Vec<&str> = states.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"dev.lifebuoy.a_r1"));
        assert!(names.contains(&"dev.lifebuoy.b_r2"));

        let builds: Vec<String> = harness
            .docker
            .mutation_log()
            .into_iter()
            .filter(|call| call.starts_with("build "))
            .collect();
        assert_eq!(builds.len(), 2, "each image built exactly once: {builds:?}");
    }

    #[tokio::test]
    async fn test_steady_state_tick_performs_no_mutations() {
        let harness = spawn_manager(FakeDocker::new(), Duration::from_millis(30));
        let apps = vec![App::repo_build(PREFIX, "a", "acme", "widgets", "r1")];

        harness.handle.update_apps(apps).await.expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || container_states(&docker).iter().any(|(_, state)| state == "running"),
            "container running",
        )
        .await;

        let converged = harness.docker.mutation_log().len();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            harness.docker.mutation_log().len(),
            converged,
            "ticks against a converged engine must not mutate anything"
        );
    }

    #[tokio::test]
    async fn test_revision_bump_builds_once_and_keeps_old_container() {
        let harness = spawn_manager(FakeDocker::new(), Duration::from_secs(3600));
        harness
            .handle
            .update_apps(vec![App::repo_build(PREFIX, "a", "acme", "widgets", "r1")])
            .await
            .expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || container_states(&docker).iter().any(|(name, _)| name == "dev.lifebuoy.a_r1"),
            "first container",
        )
        .await;

        harness
            .handle
            .update_apps(vec![App::repo_build(PREFIX, "a", "acme", "widgets", "r3")])
            .await
            .expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || {
                container_states(&docker)
                    .iter()
                    .any(|(name, state)| name == "dev.lifebuoy.a_r3" && state == "running")
            },
            "replacement container",
        )
        .await;

        let builds: Vec<String> = harness
            .docker
            .mutation_log()
            .into_iter()
            .filter(|call| call.starts_with("build dev.lifebuoy.a:r3"))
            .collect();
        assert_eq!(builds.len(), 1, "exactly one build for the new revision");
        // The superseded container is still desired by name; its cleanup is
        // out of scope.
        assert!(
            container_states(&harness.docker)
                .iter()
                .any(|(name, _)| name == "dev.lifebuoy.a_r1"),
            "old container is left alone"
        );
    }

    #[tokio::test]
    async fn test_failed_build_is_retried_on_next_wakeup() {
        let docker = FakeDocker::new();
        docker
            .failing_builds
            .lock()
            .unwrap()
            .insert("dev.lifebuoy.a:r1".to_string());
        let harness = spawn_manager(docker, Duration::from_millis(30));

        harness
            .handle
            .update_apps(vec![App::repo_build(PREFIX, "a", "acme", "widgets", "r1")])
            .await
            .expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || {
                docker
                    .mutation_log()
                    .iter()
                    .filter(|call| call.starts_with("build "))
                    .count()
                    >= 2
            },
            "build retried",
        )
        .await;
        assert!(
            container_states(&harness.docker).is_empty(),
            "no container while the build keeps failing"
        );

        // Unbreak the build; convergence must follow without a new publication.
        harness.docker.failing_builds.lock().unwrap().clear();
        let docker = harness.docker.clone();
        wait_for(
            || {
                container_states(&docker)
                    .iter()
                    .any(|(name, state)| name == "dev.lifebuoy.a_r1" && state == "running")
            },
            "container after recovery",
        )
        .await;
    }

    #[tokio::test]
    async fn test_publication_burst_coalesces_into_latest_snapshot() {
        let docker = FakeDocker::new();
        *docker.list_delay.lock().unwrap() = Some(Duration::from_millis(60));
        // The follow-up pass for a coalesced burst rides the next tick (or a
        // build-finish event), so the tick must stay in play here.
        let harness = spawn_manager(docker, Duration::from_millis(100));

        for revision in ["r1", "r2", "r3", "r4", "r5"] {
            harness
                .handle
                .update_apps(vec![App::repo_build(PREFIX, "a", "acme", "widgets", revision)])
                .await
                .expect("publish");
        }

        let docker = harness.docker.clone();
        wait_for(
            || {
                container_states(&docker)
                    .iter()
                    .any(|(name, state)| name == "dev.lifebuoy.a_r5" && state == "running")
            },
            "final snapshot converged",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let builds: Vec<String> = harness
            .docker
            .mutation_log()
            .into_iter()
            .filter(|call| call.starts_with("build "))
            .collect();
        // The first pass may see an early snapshot; the burst itself must
        // collapse into one follow-up over the latest one.
        assert!(
            builds.len() <= 2,
            "burst must not stack a build per publication: {builds:?}"
        );
        assert!(builds.contains(&"build dev.lifebuoy.a:r5".to_string()));
        for dropped in ["r2", "r3", "r4"] {
            assert!(
                !builds.contains(&format!("build dev.lifebuoy.a:{dropped}")),
                "intermediate snapshot {dropped} must be skipped: {builds:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_orphaned_container_is_removed_via_loop() {
        let docker = FakeDocker::new().with_container(FakeContainer {
            name: "dev.lifebuoy.gone_r9".to_string(),
            state: "running".to_string(),
            app_name: "gone".to_string(),
            image: "dev.lifebuoy.gone:r9".to_string(),
        });
        let harness = spawn_manager(docker, Duration::from_secs(3600));

        harness
            .handle
            .update_apps(vec![App::repo_build(PREFIX, "a", "acme", "widgets", "r1")])
            .await
            .expect("publish");

        let docker = harness.docker.clone();
        wait_for(
            || {
                !container_states(&docker)
                    .iter()
                    .any(|(name, _)| name == "dev.lifebuoy.gone_r9")
            },
            "orphan removed",
        )
        .await;
    }
}
