use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder substituted with the literal prompt text in agent arguments.
pub const PROMPT_PLACEHOLDER: &str = "{PROMPT}";

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Pending -> Failed` covers runs that could not even be started.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        matches!(
            (self, target),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid run transition: {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// Closed set of step kinds. Per-consumer behaviour lives in the dispatch
/// tables in [`crate::timeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Text,
    Init,
    System,
    ToolCall,
    ToolResult,
    Result,
    Error,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// RepoState
// ---------------------------------------------------------------------------

/// Diff snapshot captured after a run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub uncommitted_diff: String,
    pub target_branch_diff: String,
    /// Absolute repository path inside the container.
    pub repository_path: String,
}

impl RepoState {
    pub fn has_changes(&self) -> bool {
        !self.uncommitted_diff.trim().is_empty() || !self.target_branch_diff.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: StepKind,
    /// Stored unfiltered; read through [`Step::filtered_raw_response`].
    pub raw_response: String,
    pub content: Option<String>,
    pub tool_use_id: Option<String>,
    pub repo_state: Option<RepoState>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        run_id: Uuid,
        kind: StepKind,
        raw_response: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            kind,
            raw_response: raw_response.into(),
            content,
            tool_use_id: None,
            repo_state: None,
            created_at: Utc::now(),
        }
    }

    /// A system step whose raw response and content are the same message.
    pub fn system(run_id: Uuid, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(run_id, StepKind::System, message.clone(), Some(message))
    }

    pub fn error(run_id: Uuid, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(run_id, StepKind::Error, message.clone(), Some(message))
    }

    pub fn with_tool_use_id(mut self, tool_use_id: Option<String>) -> Self {
        self.tool_use_id = tool_use_id;
        self
    }

    pub fn with_repo_state(mut self, repo_state: RepoState) -> Self {
        self.repo_state = Some(repo_state);
        self
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub prompt: String,
    pub status: RunStatus,
    /// Set only while the run's agent container is alive.
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(task_id: Uuid, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            prompt: prompt.into(),
            status: RunStatus::Pending,
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `status`, stamping `started_at` when the run begins.
    pub fn set_status(&mut self, status: RunStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(status) {
            return Err(StatusTransitionError {
                from: self.status,
                to: status,
            });
        }
        if status == RunStatus::Running {
            self.started_at = Some(Utc::now());
        }
        self.status = status;
        Ok(())
    }

    /// True when this run holds a container that a newer sibling must stop.
    pub fn holds_live_container(&self) -> bool {
        self.status == RunStatus::Running && self.container_id.is_some()
    }

    /// `siblings` must be every run of the task in creation order (including
    /// this one). The first run gates clone, setup and MCP registration.
    pub fn is_first_run(&self, siblings: &[Run]) -> bool {
        siblings.first().map_or(true, |first| first.id == self.id)
    }
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// Named path an agent wants persisted across runs, e.g. its home directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVolume {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// `None` marks the workspace volume.
    pub volume_name: Option<String>,
    /// Docker volume name.
    pub volume_id: String,
    pub container_path: String,
}

impl VolumeMount {
    pub fn is_workspace(&self) -> bool {
        self.volume_name.is_none()
    }

    /// `volume:container_path` bind string.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.volume_id, self.container_path)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub description: String,
    /// Branch every diff is taken against; detected from the clone when unset.
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub auto_push_enabled: bool,
    #[serde(default)]
    pub auto_push_branch: Option<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Image built from the project's dev Dockerfile, used instead of the agent image.
    #[serde(default)]
    pub dev_image: Option<String>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a workspace volume mounted at the agent's working
    /// directory plus one volume per agent-declared path.
    pub fn new(project_id: Uuid, agent: &Agent, user_id: Uuid) -> Self {
        let id = Uuid::new_v4();
        let mut volume_mounts = vec![VolumeMount {
            volume_name: None,
            volume_id: format!("runbox_task_{}_workspace", id.simple()),
            container_path: agent.workplace_path.clone(),
        }];
        volume_mounts.extend(agent.volumes.iter().map(|v| VolumeMount {
            volume_name: Some(v.name.clone()),
            volume_id: format!("runbox_task_{}_{}", id.simple(), v.name),
            container_path: v.path.clone(),
        }));

        Self {
            id,
            project_id,
            agent_id: agent.id,
            user_id,
            description: String::new(),
            target_branch: None,
            auto_push_enabled: false,
            auto_push_branch: None,
            volume_mounts,
            dev_image: None,
            archived_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn workspace_mount(&self) -> Option<&VolumeMount> {
        self.volume_mounts.iter().find(|m| m.is_workspace())
    }

    pub fn volume_binds(&self) -> Vec<String> {
        self.volume_mounts.iter().map(VolumeMount::bind).collect()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Branch auto-push targets, if auto-push is on and a branch is set.
    pub fn auto_push_target(&self) -> Option<&str> {
        if !self.auto_push_enabled {
            return None;
        }
        self.auto_push_branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
    }
}

// ---------------------------------------------------------------------------
// LogProcessorKind
// ---------------------------------------------------------------------------

/// Which log processor turns an agent's output into steps.
///
/// Parsed by name, so an unknown processor fails when the agent definition
/// is loaded rather than when a run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogProcessorKind {
    Text,
    ClaudeJson,
    ClaudeStreamingJson,
    #[default]
    Auto,
}

impl LogProcessorKind {
    pub fn name(&self) -> &'static str {
        match self {
            LogProcessorKind::Text => "Text",
            LogProcessorKind::ClaudeJson => "ClaudeJson",
            LogProcessorKind::ClaudeStreamingJson => "ClaudeStreamingJson",
            LogProcessorKind::Auto => "Auto",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log processor '{0}' (expected Text, ClaudeJson, ClaudeStreamingJson or Auto)")]
pub struct UnknownLogProcessor(pub String);

impl FromStr for LogProcessorKind {
    type Err = UnknownLogProcessor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Text" => Ok(LogProcessorKind::Text),
            "ClaudeJson" => Ok(LogProcessorKind::ClaudeJson),
            "ClaudeStreamingJson" => Ok(LogProcessorKind::ClaudeStreamingJson),
            "Auto" => Ok(LogProcessorKind::Auto),
            other => Err(UnknownLogProcessor(other.to_string())),
        }
    }
}

impl TryFrom<String> for LogProcessorKind {
    type Error = UnknownLogProcessor;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogProcessorKind> for String {
    fn from(kind: LogProcessorKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for LogProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// How to register the agent with an MCP endpoint on a task's first run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpRegistration {
    pub endpoint: String,
    #[serde(default = "default_mcp_server_name")]
    pub server_name: String,
    /// Arguments preceding the server name, e.g. `claude mcp add --transport sse`.
    #[serde(default = "default_mcp_register_arguments")]
    pub register_arguments: Vec<String>,
}

fn default_mcp_server_name() -> String {
    "runbox".into()
}

fn default_mcp_register_arguments() -> Vec<String> {
    ["claude", "mcp", "add", "--transport", "sse"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub docker_image: String,
    /// Docker endpoint for this agent's containers; the configured default otherwise.
    #[serde(default)]
    pub docker_host: Option<String>,
    pub start_arguments: Vec<String>,
    #[serde(default)]
    pub continue_arguments: Vec<String>,
    pub workplace_path: String,
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub log_processor: LogProcessorKind,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<AgentVolume>,
    #[serde(default)]
    pub mcp: Option<McpRegistration>,
    /// Home directory inside the container; `.gitconfig` is written here.
    #[serde(default)]
    pub home_path: Option<String>,
    #[serde(default)]
    pub instructions_mount_path: Option<String>,
    #[serde(default)]
    pub ssh_mount_path: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentValidationError {
    #[error("agent '{0}' has no docker image")]
    MissingImage(String),
    #[error("agent '{0}' has no start arguments")]
    MissingStartArguments(String),
    #[error("agent path must be absolute: {0}")]
    RelativePath(String),
    #[error("duplicate agent volume name: {0}")]
    DuplicateVolume(String),
}

impl Agent {
    /// Build the container command for a run, replacing every occurrence of
    /// [`PROMPT_PLACEHOLDER`] in every argument with `prompt`.
    ///
    /// Continuation runs fall back to the start arguments when the agent
    /// declares no continue arguments.
    pub fn command_for(&self, prompt: &str, first_run: bool) -> Vec<String> {
        let template = if first_run || self.continue_arguments.is_empty() {
            &self.start_arguments
        } else {
            &self.continue_arguments
        };
        template
            .iter()
            .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt))
            .collect()
    }

    pub fn env_list(&self) -> Vec<String> {
        self.env_variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    pub fn validate(&self) -> Result<(), AgentValidationError> {
        if self.docker_image.trim().is_empty() {
            return Err(AgentValidationError::MissingImage(self.name.clone()));
        }
        if self.start_arguments.is_empty() {
            return Err(AgentValidationError::MissingStartArguments(self.name.clone()));
        }

        let paths = std::iter::once(Some(&self.workplace_path))
            .chain([
                self.home_path.as_ref(),
                self.instructions_mount_path.as_ref(),
                self.ssh_mount_path.as_ref(),
            ])
            .chain(self.volumes.iter().map(|v| Some(&v.path)))
            .flatten();
        for path in paths {
            if !path.starts_with('/') {
                return Err(AgentValidationError::RelativePath(path.clone()));
            }
        }

        let mut seen = HashSet::new();
        for volume in &self.volumes {
            if !seen.insert(volume.name.as_str()) {
                return Err(AgentValidationError::DuplicateVolume(volume.name.clone()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub repository_url: Option<String>,
    /// Subpath of the workspace the repository lives in; blank means the root.
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Dockerfile path relative to the repository root, for dev-image builds.
    #[serde(default)]
    pub dev_dockerfile_path: Option<String>,
}

impl Project {
    pub fn repository_url(&self) -> Option<&str> {
        self.repository_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    pub fn setup_script(&self) -> Option<&str> {
        self.setup_script
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// Repo subpath with surrounding slashes stripped; empty for the root.
    pub fn repo_subpath(&self) -> &str {
        self.repo_path.trim().trim_matches('/')
    }

    /// Absolute repository directory under the given mount path.
    pub fn repo_dir(&self, mount_path: &str) -> String {
        join_container_path(mount_path, self.repo_subpath())
    }

    pub fn secret_env(&self) -> Vec<String> {
        self.secrets
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// Join a container path with a relative subpath, ignoring a leading slash
/// on the subpath.
pub fn join_container_path(base: &str, sub: &str) -> String {
    let sub = sub.trim_start_matches('/');
    if sub.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), sub)
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Whether the GitHub token may be exposed to agent containers as env.
    #[serde(default)]
    pub allow_github_token_access: bool,
    #[serde(default)]
    pub git_config: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Bearer token sent when registering the agent with an MCP endpoint.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            github_token: None,
            ssh_key: None,
            allow_github_token_access: false,
            git_config: None,
            instructions: None,
            api_token: None,
        }
    }

    pub fn github_token(&self) -> Option<&str> {
        non_blank(self.github_token.as_deref())
    }

    pub fn ssh_key(&self) -> Option<&str> {
        non_blank(self.ssh_key.as_deref())
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("github_token", &mask(&self.github_token))
            .field("ssh_key", &mask(&self.ssh_key))
            .field("allow_github_token_access", &self.allow_github_token_access)
            .field("api_token", &mask(&self.api_token))
            .finish()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
