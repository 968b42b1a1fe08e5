use std::sync::Arc;

use chrono::Utc;
use rb_core::store::RunStore;
use rb_runtime::{ContainerConfigBuilder, ContainerRuntime, DockerEndpoint};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, RunError};
use crate::events::{EventBus, RunEvent};
use crate::executor::RunSettings;

/// Rebuilds a task's dev image from the Dockerfile in its workspace.
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RunStore>,
    bus: EventBus,
    settings: RunSettings,
}

impl ImageBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RunStore>,
        bus: EventBus,
        settings: RunSettings,
    ) -> Self {
        Self {
            runtime,
            store,
            bus,
            settings,
        }
    }

    /// Build a fresh image from the task's repository, record it on the task
    /// and return its tag. The previous image is removed best-effort.
    #[instrument(skip(self))]
    pub async fn rebuild(&self, task_id: Uuid) -> Result<String> {
        let mut task = self.store.get_task(task_id).await?;
        let project = self.store.get_project(task.project_id).await?;
        let agent = self.store.get_agent(task.agent_id).await?;
        let user = self.store.get_user(task.user_id).await?;

        let dockerfile = project
            .dev_dockerfile_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RunError::FatalSetup(format!(
                    "project '{}' has no dev Dockerfile configured",
                    project.name
                ))
            })?
            .trim_start_matches("./")
            .to_string();
        let endpoint = DockerEndpoint::resolve(
            agent.docker_host.as_deref(),
            self.settings.docker_endpoint.as_deref(),
        )
        .map_err(|e| RunError::setup("docker endpoint", e))?;

        let context = {
            let builder =
                ContainerConfigBuilder::new(&agent, &project, &user, &task, endpoint.clone());
            let handle = self
                .runtime
                .create(&builder.build())
                .await
                .map_err(|e| RunError::setup("build container", e))?;
            // `/.` archives the directory's contents rather than the directory.
            let archived = self
                .runtime
                .archive_out(&handle, &format!("{}/.", builder.repo_dir()))
                .await;
            self.runtime.cleanup(&handle).await;
            archived.map_err(|e| RunError::setup("workspace export", e))?
        };

        let tag = format!("runbox-dev-{}:{}", task.id.simple(), Utc::now().timestamp());
        self.runtime
            .build_image(&endpoint, context, &dockerfile, &tag)
            .await
            .map_err(|e| RunError::setup("image build", e))?;
        info!(tag = %tag, dockerfile = %dockerfile, "dev image built");

        let previous = task.dev_image.replace(tag.clone());
        self.store.update_task(&task).await?;
        self.bus.publish(RunEvent::TaskUpdated { task_id: task.id });

        if let Some(old) = previous.filter(|old| *old != tag) {
            if let Err(e) = self.runtime.remove_image(&endpoint, &old).await {
                let err = RunError::BestEffortFailure(format!("removing image {old}: {e}"));
                warn!(error = %err, "previous dev image not removed");
            }
        }
        Ok(tag)
    }
}
