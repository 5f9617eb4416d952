//! One reconciliation pass: compare the desired snapshot to the engine and
//! converge.
//!
//! Three phases, each iterating over the desired apps in order. Every app is
//! independent: an engine error skips that app for this pass and the next
//! pass retries. Only objects carrying the managed label are ever removed.

use std::collections::HashSet;
use std::sync::Arc;

use crate::apps::{App, BuildResources};
use crate::docker::{ContainerQuery, ContainerSpec, Docker};
use crate::queue::JobSubmitter;

pub(crate) struct ReconcilePass {
    docker: Arc<dyn Docker>,
    builds: JobSubmitter,
    resources: Arc<BuildResources>,
    apps: Arc<Vec<App>>,
}

impl ReconcilePass {
    pub(crate) fn new(
        docker: Arc<dyn Docker>,
        builds: JobSubmitter,
        resources: Arc<BuildResources>,
        apps: Arc<Vec<App>>,
    ) -> Self {
        Self {
            docker,
            builds,
            resources,
            apps,
        }
    }

    pub(crate) async fn run(self) {
        tracing::debug!("container reconcile started");
        self.ensure_created().await;
        self.ensure_started().await;
        self.remove_orphans().await;
        tracing::debug!("container reconcile finished");
    }

    /// Phase 1: every desired app has a container, or a build on the way.
    async fn ensure_created(&self) {
        for app in self.apps.iter() {
            let container_name = app.container_name();
            let image_ref = app.image_ref();

            let query = ContainerQuery {
                name: Some(container_name.clone()),
                ancestor: Some(image_ref.clone()),
                include_stopped: true,
                ..ContainerQuery::default()
            };
            let containers = match self.docker.list_containers(&query).await {
                Ok(containers) => containers,
                Err(error) => {
                    tracing::error!(app = %app.name(), error = %error, "failed to list containers");
                    continue;
                }
            };
            if !containers.is_empty() {
                tracing::debug!(app = %app.name(), "container already exists, skipping creation");
                continue;
            }

            if !app.is_built(self.docker.as_ref()).await {
                tracing::info!(app = %app.name(), "app build queued");
                let job_app = app.clone();
                let resources = self.resources.clone();
                self.builds
                    .submit(app.name().to_string(), async move {
                        job_app.build(&resources).await
                    })
                    .await;
                continue;
            }

            tracing::info!(app = %app.name(), container = %container_name, "creating container");
            let spec = ContainerSpec {
                image: &image_ref,
                name: &container_name,
                app_name: app.name(),
                volumes: app.volumes(),
            };
            if let Err(error) = self.docker.create_container(spec).await {
                tracing::error!(app = %app.name(), error = %error, "failed to create container");
            }
        }
    }

    /// Phase 2: every created container is running.
    async fn ensure_started(&self) {
        for app in self.apps.iter() {
            let container_name = app.container_name();
            let image_ref = app.image_ref();

            let running_query = ContainerQuery {
                name: Some(container_name.clone()),
                ancestor: Some(image_ref.clone()),
                running_only: true,
                ..ContainerQuery::default()
            };
            match self.docker.list_containers(&running_query).await {
                Ok(running) if !running.is_empty() => {
                    tracing::debug!(app = %app.name(), "container already running, skipping start");
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(app = %app.name(), error = %error, "failed to list containers");
                    continue;
                }
            }

            let created_query = ContainerQuery {
                name: Some(container_name.clone()),
                ancestor: Some(image_ref.clone()),
                include_stopped: true,
                ..ContainerQuery::default()
            };
            match self.docker.list_containers(&created_query).await {
                Ok(created) if created.is_empty() => {
                    tracing::debug!(app = %app.name(), "container doesn't exist yet, skipping start");
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(app = %app.name(), error = %error, "failed to list containers");
                    continue;
                }
            }

            match self.docker.start_container(&container_name).await {
                Ok(()) => {
                    tracing::info!(app = %app.name(), container = %container_name, "container started");
                }
                Err(error) => {
                    tracing::error!(app = %app.name(), error = %error, "failed to start container");
                }
            }
        }
    }

    /// Phase 3: managed containers whose app is no longer desired are
    /// stopped and removed.
    ///
    /// Containers of a still-desired app under a superseded image keep
    /// running; image pruning is out of scope.
    async fn remove_orphans(&self) {
        let query = ContainerQuery {
            include_stopped: true,
            ..ContainerQuery::default()
        };
        let containers = match self.docker.list_containers(&query).await {
            Ok(containers) => containers,
            Err(error) => {
                tracing::error!(error = %error, "failed to list managed containers");
                return;
            }
        };

        let desired_names: HashSet<&str> = self.apps.iter().map(App::name).collect();
        for container in containers {
            let Some(app_name) = container.app_name.as_deref() else {
                continue;
            };
            if desired_names.contains(app_name) {
                continue;
            }

            tracing::info!(
                container = %container.name,
                app = %app_name,
                "removing container for undesired app"
            );
            if container.state == "running" {
                if let Err(error) = self.docker.stop_container(&container.name).await {
                    tracing::error!(container = %container.name, error = %error, "failed to stop container");
                    continue;
                }
            }
            if let Err(error) = self.docker.remove_container(&container.name).await {
                tracing::error!(container = %container.name, error = %error, "failed to remove container");
            }
        }
    }
}
