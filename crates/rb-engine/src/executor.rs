use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rb_core::config::Config;
use rb_core::store::RunStore;
use rb_core::types::{
    Agent, McpRegistration, Project, Run, RunStatus, StatusTransitionError, Step, Task, User,
};
use rb_git::{GitError, GitOperations};
use rb_logs::{decode_container_output, LogProcessor};
use rb_runtime::files::provision_agent_container;
use rb_runtime::{
    ContainerConfigBuilder, ContainerHandle, ContainerRuntime, ContainerSpec, DockerEndpoint,
    ExitStatus, RuntimeError,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, RunError};
use crate::events::{EventBus, RunEvent};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The slice of [`Config`] a run needs.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Endpoint used when the agent names no Docker host of its own.
    pub docker_endpoint: Option<String>,
    pub setup_timeout: Duration,
    pub mcp_timeout: Duration,
    pub git_timeout: Duration,
    pub backtrace_lines: usize,
    pub commit_message: String,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            docker_endpoint: config.docker.endpoint.clone(),
            setup_timeout: config.timeouts.setup(),
            mcp_timeout: config.timeouts.mcp(),
            git_timeout: config.timeouts.git(),
            backtrace_lines: config.runs.backtrace_lines,
            commit_message: config.runs.commit_message.clone(),
        }
    }

    pub fn commit_message_for(&self, run_id: Uuid) -> String {
        self.commit_message.replace("{RUN_ID}", &run_id.to_string())
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a run reads, loaded once before the first phase.
struct RunContext {
    task: Task,
    project: Project,
    agent: Agent,
    user: User,
    first_run: bool,
}

// ---------------------------------------------------------------------------
// RunExecutor
// ---------------------------------------------------------------------------

/// Drives one run from `pending` to a terminal state.
///
/// Phases run strictly in order: cancel siblings, clone, setup script, MCP
/// registration (those three on a task's first run only), agent container,
/// repository-state capture and auto-push. Teardown runs whatever happened.
pub struct RunExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RunStore>,
    bus: EventBus,
    settings: RunSettings,
}

impl RunExecutor {
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

    /// Execute the pending run `run_id` and return it in its final state.
    ///
    /// Phase failures do not surface here: they end up as error steps on a
    /// `failed` run. `Err` means the run could not be loaded or persisted.
    pub async fn execute(&self, run_id: Uuid) -> Result<Run> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(StatusTransitionError {
                from: run.status,
                to: RunStatus::Running,
            }
            .into());
        }
        let ctx = self.load_context(&run).await?;

        let span = info_span!(
            "run",
            run_id = %run.id,
            task_id = %ctx.task.id,
            agent = %ctx.agent.name,
        );
        self.drive(&mut run, &ctx).instrument(span).await?;
        Ok(run)
    }

    async fn load_context(&self, run: &Run) -> Result<RunContext> {
        let task = self.store.get_task(run.task_id).await?;
        let project = self.store.get_project(task.project_id).await?;
        let agent = self.store.get_agent(task.agent_id).await?;
        let user = self.store.get_user(task.user_id).await?;
        let siblings = self.store.runs_for_task(task.id).await?;
        let first_run = run.is_first_run(&siblings);
        Ok(RunContext {
            task,
            project,
            agent,
            user,
            first_run,
        })
    }

    async fn drive(&self, run: &mut Run, ctx: &RunContext) -> Result<()> {
        let task_id = ctx.task.id;
        let endpoint = match self.preflight(ctx) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(error = %err, "run rejected before start");
                return self.abort(run, task_id, &err).await;
            }
        };
        if let Err(err) = self.start(run, task_id, &endpoint).await {
            warn!(error = %err, "run could not be started");
            return self.abort(run, task_id, &err).await;
        }
        info!(first_run = ctx.first_run, endpoint = %endpoint, "run started");

        let mut agent_container = None;
        let outcome = self
            .run_phases(run, ctx, &endpoint, &mut agent_container)
            .await;
        let finished = match outcome {
            Ok(()) => self.complete(run, task_id).await,
            Err(err) => {
                warn!(error = %err, "run failed");
                self.record_failure(run, task_id, &err).await
            }
        };
        let torn_down = self.teardown(run, agent_container).await;
        finished.and(torn_down)
    }

    async fn start(&self, run: &mut Run, task_id: Uuid, endpoint: &DockerEndpoint) -> Result<()> {
        self.cancel_siblings(run, task_id, endpoint).await?;
        self.transition(run, task_id, RunStatus::Running).await
    }

    /// Fail a run that never reached its phases.
    async fn abort(&self, run: &mut Run, task_id: Uuid, err: &RunError) -> Result<()> {
        let failed = self.record_failure(run, task_id, err).await;
        let torn_down = self.teardown(run, None).await;
        failed.and(torn_down)
    }

    fn preflight(&self, ctx: &RunContext) -> Result<DockerEndpoint> {
        if ctx.task.is_archived() {
            return Err(RunError::FatalSetup(format!(
                "task {} is archived",
                ctx.task.id
            )));
        }
        DockerEndpoint::resolve(
            ctx.agent.docker_host.as_deref(),
            self.settings.docker_endpoint.as_deref(),
        )
        .map_err(|e| RunError::setup("docker endpoint", e))
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn run_phases(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        endpoint: &DockerEndpoint,
        agent_container: &mut Option<ContainerHandle>,
    ) -> Result<()> {
        let builder = ContainerConfigBuilder::new(
            &ctx.agent,
            &ctx.project,
            &ctx.user,
            &ctx.task,
            endpoint.clone(),
        );
        let git = GitOperations::new(
            self.runtime.as_ref(),
            &builder,
            &ctx.agent,
            &ctx.project,
            &ctx.user,
            self.settings.git_timeout,
        );

        let mut target_branch = ctx.task.target_branch.clone();
        if ctx.first_run {
            if let Some(branch) = self.clone_phase(ctx, &git).await? {
                target_branch = Some(branch);
            }
            self.setup_phase(run, ctx, &builder).await?;
            self.mcp_phase(run, ctx, &builder).await?;
        }
        let target_branch = target_branch.or_else(|| ctx.project.default_branch.clone());

        self.agent_phase(run, ctx, &builder, agent_container).await?;

        if let Err(err) = self
            .repo_state_phase(run, ctx.task.id, &git, target_branch.as_deref())
            .await
        {
            warn!(phase = "repo_state", error = %err, "repository state not captured");
        }
        self.auto_push_phase(run, ctx, &git).await
    }

    /// Clone the repository and, when the task has no target branch yet,
    /// persist the branch the clone checked out.
    async fn clone_phase(
        &self,
        ctx: &RunContext,
        git: &GitOperations<'_>,
    ) -> Result<Option<String>> {
        if ctx.project.repository_url().is_none() {
            debug!("no repository configured, skipping clone");
            return Ok(None);
        }
        git.clone_repo()
            .await
            .map_err(|e| fatal_git("clone", e))?;

        if ctx.task.target_branch.is_some() {
            return Ok(None);
        }
        let branch = git
            .current_branch()
            .await
            .map_err(|e| fatal_git("branch detection", e))?;
        if branch.is_empty() || branch == "HEAD" {
            warn!("clone left a detached HEAD, target branch not set");
            return Ok(None);
        }

        let mut task = self.store.get_task(ctx.task.id).await?;
        task.target_branch = Some(branch.clone());
        self.store.update_task(&task).await?;
        self.bus.publish(RunEvent::TaskUpdated { task_id: task.id });
        info!(branch = %branch, "target branch detected");
        Ok(Some(branch))
    }

    async fn setup_phase(
        &self,
        run: &Run,
        ctx: &RunContext,
        builder: &ContainerConfigBuilder<'_>,
    ) -> Result<()> {
        let Some(script) = ctx.project.setup_script() else {
            return Ok(());
        };
        info!(phase = "setup", "running setup script");
        let (status, output) = self
            .run_oneshot(&builder.setup(script), self.settings.setup_timeout, "setup script")
            .await?;
        if !status.success() {
            return Err(RunError::FatalSetup(format!(
                "setup script exited with code {}\n{}",
                status.code,
                output.trim_end()
            )));
        }

        let message = match output.trim_end() {
            "" => "Setup script completed".to_string(),
            out => format!("Setup script completed\n{out}"),
        };
        self.append(ctx.task.id, Step::system(run.id, message)).await
    }

    async fn mcp_phase(
        &self,
        run: &Run,
        ctx: &RunContext,
        builder: &ContainerConfigBuilder<'_>,
    ) -> Result<()> {
        let Some(mcp) = ctx.agent.mcp.as_ref() else {
            return Ok(());
        };
        info!(phase = "mcp", endpoint = %mcp.endpoint, "registering MCP server");
        let argv = mcp_register_command(mcp, &ctx.user, ctx.task.id);
        let (status, output) = self
            .run_oneshot(
                &builder.mcp_register(argv),
                self.settings.mcp_timeout,
                "MCP registration",
            )
            .await?;
        if !status.success() {
            return Err(RunError::FatalSetup(format!(
                "MCP registration exited with code {}: {}",
                status.code,
                output.trim()
            )));
        }
        self.append(
            ctx.task.id,
            Step::system(
                run.id,
                format!("Registered MCP server '{}' at {}", mcp.server_name, mcp.endpoint),
            ),
        )
        .await
    }

    /// Create, start and wait for the agent container, then turn its output
    /// into steps.
    async fn agent_phase(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        builder: &ContainerConfigBuilder<'_>,
        slot: &mut Option<ContainerHandle>,
    ) -> Result<()> {
        let cmd = ctx.agent.command_for(&run.prompt, ctx.first_run);
        let spec = builder.agent_run(cmd);
        let handle = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| RunError::setup("agent container", e))?;
        *slot = Some(handle.clone());
        run.container_id = Some(handle.id.clone());
        self.store.update_run(run).await?;
        info!(
            phase = "agent",
            container_id = %handle.id,
            image = %spec.image,
            "agent container created"
        );

        self.runtime
            .start(&handle)
            .await
            .map_err(|e| RunError::setup("agent container", e))?;
        // Races the agent's own startup; the files land best-effort.
        let provisioned =
            provision_agent_container(self.runtime.as_ref(), &handle, &ctx.agent, &ctx.user)
                .await;
        debug!(provisioned, "agent files provisioned");

        let status = self.runtime.wait(&handle, None).await?;
        let logs = self.runtime.logs(&handle).await?;
        let output = decode_container_output(&logs);
        let payloads: Vec<_> = LogProcessor::new(ctx.agent.log_processor)
            .process(&output)
            .collect();
        let count = payloads.len();
        for payload in payloads {
            self.append(ctx.task.id, payload.into_step(run.id)).await?;
        }
        info!(exit_code = status.code, steps = count, "agent container finished");

        if !status.success() {
            self.append(
                ctx.task.id,
                Step::system(run.id, format!("Agent exited with code {}", status.code)),
            )
            .await?;
        }
        Ok(())
    }

    async fn repo_state_phase(
        &self,
        run: &Run,
        task_id: Uuid,
        git: &GitOperations<'_>,
        target_branch: Option<&str>,
    ) -> Result<()> {
        let state = git
            .capture_repo_state(target_branch)
            .await
            .map_err(|e| RunError::BestEffortFailure(format!("repository state: {e}")))?;
        if !state.has_changes() {
            debug!("no repository changes to record");
            return Ok(());
        }
        self.append(
            task_id,
            Step::system(run.id, "Repository state captured").with_repo_state(state),
        )
        .await
    }

    async fn auto_push_phase(
        &self,
        run: &Run,
        ctx: &RunContext,
        git: &GitOperations<'_>,
    ) -> Result<()> {
        let Some(branch) = ctx.task.auto_push_target() else {
            return Ok(());
        };
        let message = self.settings.commit_message_for(run.id);
        let step = match git.push(branch, &message).await {
            Ok(()) => Step::system(run.id, format!("Pushed changes to '{branch}'")),
            Err(e) => {
                let err =
                    RunError::BestEffortFailure(format!("Auto-push to '{branch}' failed: {e}"));
                warn!(phase = "auto_push", error = %err, "auto-push failed");
                Step::error(run.id, err.to_string())
            }
        };
        self.append(ctx.task.id, step).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle bookkeeping
    // -----------------------------------------------------------------------

    /// Stop every other running run of the task that still holds a
    /// container and mark it failed. Best-effort: two runs starting at the
    /// same moment can both get past this check.
    async fn cancel_siblings(
        &self,
        run: &Run,
        task_id: Uuid,
        endpoint: &DockerEndpoint,
    ) -> Result<usize> {
        let mut cancelled = 0;
        for mut sibling in self.store.runs_for_task(task_id).await? {
            if sibling.id == run.id || !sibling.holds_live_container() {
                continue;
            }
            let Some(container_id) = sibling.container_id.take() else {
                continue;
            };
            let handle = ContainerHandle::new(container_id, endpoint.clone());
            if let Err(e) = self.runtime.stop_if_present(&handle).await {
                warn!(
                    sibling = %sibling.id,
                    container_id = %handle.id,
                    error = %e,
                    "could not stop superseded run"
                );
            }

            sibling.set_status(RunStatus::Failed)?;
            sibling.completed_at = Some(Utc::now());
            self.store.update_run(&sibling).await?;
            self.publish_status(&sibling, task_id);
            self.append(
                task_id,
                Step::system(
                    sibling.id,
                    format!("Run cancelled: superseded by run {}", run.id),
                ),
            )
            .await?;
            info!(sibling = %sibling.id, "superseded run cancelled");
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn transition(&self, run: &mut Run, task_id: Uuid, status: RunStatus) -> Result<()> {
        run.set_status(status)?;
        self.store.update_run(run).await?;
        self.publish_status(run, task_id);
        Ok(())
    }

    fn publish_status(&self, run: &Run, task_id: Uuid) {
        self.bus.publish(RunEvent::RunStatusChanged {
            task_id,
            run_id: run.id,
            status: run.status,
        });
    }

    /// A newer sibling may have marked this run failed while it was running.
    async fn cancelled_meanwhile(&self, run: &mut Run) -> Result<bool> {
        let stored = self.store.get_run(run.id).await?;
        if run.status == RunStatus::Running && stored.status == RunStatus::Failed {
            run.status = RunStatus::Failed;
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete(&self, run: &mut Run, task_id: Uuid) -> Result<()> {
        if self.cancelled_meanwhile(run).await? {
            info!("run was superseded, leaving it failed");
            return Ok(());
        }
        self.transition(run, task_id, RunStatus::Completed).await?;
        info!("run completed");
        Ok(())
    }

    async fn record_failure(&self, run: &mut Run, task_id: Uuid, err: &RunError) -> Result<()> {
        let report = failure_report(err, self.settings.backtrace_lines);
        let appended = self.append(task_id, Step::error(run.id, report)).await;
        if self.cancelled_meanwhile(run).await? || run.status.is_terminal() {
            return appended;
        }
        let failed = self.transition(run, task_id, RunStatus::Failed).await;
        appended.and(failed)
    }

    /// Stamp completion, forget the container and delete it. Deletion
    /// failures are logged only.
    async fn teardown(&self, run: &mut Run, container: Option<ContainerHandle>) -> Result<()> {
        run.completed_at = Some(Utc::now());
        run.container_id = None;
        let saved = self.store.update_run(run).await;
        if let Some(handle) = container {
            self.runtime.cleanup(&handle).await;
        }
        saved?;
        debug!(status = %run.status, "run torn down");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn append(&self, task_id: Uuid, step: Step) -> Result<()> {
        self.store.insert_step(&step).await?;
        debug!(step_id = %step.id, kind = %step.kind, "step appended");
        self.bus.publish(RunEvent::StepAppended { task_id, step });
        Ok(())
    }

    /// Create, start and wait for a one-shot container with a deadline,
    /// returning its exit status and decoded output. The container is
    /// deleted whatever happens.
    async fn run_oneshot(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
        phase: &'static str,
    ) -> Result<(ExitStatus, String)> {
        let handle = self
            .runtime
            .create(spec)
            .await
            .map_err(|e| RunError::setup(phase, e))?;
        let result = async {
            self.runtime.start(&handle).await?;
            let status = self.runtime.wait(&handle, Some(timeout)).await?;
            let logs = self.runtime.logs(&handle).await?;
            Ok::<_, RuntimeError>((status, decode_container_output(&logs)))
        }
        .await;
        self.runtime.cleanup(&handle).await;
        result.map_err(|e| RunError::setup(phase, e))
    }
}

fn fatal_git(phase: &str, err: GitError) -> RunError {
    match err {
        GitError::CredentialMissing(message) => RunError::CredentialMissing(message),
        other => RunError::setup(phase, other),
    }
}

/// Arguments for the MCP registration container: the agent's register
/// command, the server name and endpoint, and the auth and task headers.
pub fn mcp_register_command(mcp: &McpRegistration, user: &User, task_id: Uuid) -> Vec<String> {
    let mut argv = mcp.register_arguments.clone();
    argv.push(mcp.server_name.clone());
    argv.push(mcp.endpoint.clone());
    if let Some(token) = user.api_token.as_deref().filter(|t| !t.trim().is_empty()) {
        argv.push("--header".into());
        argv.push(format!("Authorization: Bearer {}", token.trim()));
    }
    argv.push("--header".into());
    argv.push(format!("X-Runbox-Task-Id: {task_id}"));
    argv
}

/// Error message, its cause chain and at most `lines` backtrace lines.
fn failure_report(err: &RunError, lines: usize) -> String {
    let mut report = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        report.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        report.extend(backtrace.to_string().lines().take(lines).map(str::to_string));
    }
    report.join("\n")
}
