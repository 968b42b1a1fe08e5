//! Task manifests: one TOML file describing the user, project, agent and
//! task of a run.
//!
//! Credentials are never written inline; the manifest names the environment
//! variable or file they are read from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rb_core::types::{
    Agent, AgentVolume, LogProcessorKind, McpRegistration, Project, Task, User,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub user: UserSection,
    pub project: ProjectSection,
    pub agent: AgentSection,
    #[serde(default)]
    pub task: TaskSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSection {
    pub name: String,
    /// Environment variable holding the GitHub token.
    #[serde(default)]
    pub github_token_env: Option<String>,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default)]
    pub allow_github_token_access: bool,
    #[serde(default)]
    pub git_config_file: Option<PathBuf>,
    #[serde(default)]
    pub instructions_file: Option<PathBuf>,
    #[serde(default)]
    pub api_token_env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub setup_script: Option<String>,
    /// Secret name to the environment variable holding its value.
    #[serde(default)]
    pub secrets_env: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dockerfile_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    pub name: String,
    pub docker_image: String,
    #[serde(default)]
    pub docker_host: Option<String>,
    pub start_arguments: Vec<String>,
    #[serde(default)]
    pub continue_arguments: Vec<String>,
    #[serde(default = "default_workplace_path")]
    pub workplace_path: String,
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub log_processor: LogProcessorKind,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<AgentVolume>,
    #[serde(default)]
    pub mcp: Option<McpRegistration>,
    #[serde(default)]
    pub home_path: Option<String>,
    #[serde(default)]
    pub instructions_mount_path: Option<String>,
    #[serde(default)]
    pub ssh_mount_path: Option<String>,
}

fn default_workplace_path() -> String {
    "/workspace".into()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSection {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub auto_push_branch: Option<String>,
}

/// Records built from a manifest, ready to persist.
pub struct Records {
    pub user: User,
    pub project: Project,
    pub agent: Agent,
    pub task: Task,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing manifest {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Build the records, reading credentials through `lookup` (normally
    /// `std::env::var`). Relative file paths resolve against `base_dir`.
    pub fn into_records(
        self,
        base_dir: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Records> {
        let read = |path: &Path| -> anyhow::Result<String> {
            let path = base_dir.join(path);
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        };
        let env = |name: &str| -> anyhow::Result<String> {
            lookup(name).with_context(|| format!("environment variable {name} is not set"))
        };

        let u = self.user;
        let mut user = User::new(u.name);
        user.github_token = u.github_token_env.as_deref().map(env).transpose()?;
        user.ssh_key = u.ssh_key_file.as_deref().map(read).transpose()?;
        user.allow_github_token_access = u.allow_github_token_access;
        user.git_config = u.git_config_file.as_deref().map(read).transpose()?;
        user.instructions = u.instructions_file.as_deref().map(read).transpose()?;
        user.api_token = u.api_token_env.as_deref().map(env).transpose()?;

        let p = self.project;
        let secrets = p
            .secrets_env
            .iter()
            .map(|(key, var)| Ok((key.clone(), env(var)?)))
            .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
        let project = Project {
            id: Uuid::new_v4(),
            name: p.name,
            repository_url: p.repository_url,
            repo_path: p.repo_path,
            default_branch: p.default_branch,
            setup_script: p.setup_script,
            secrets,
            dev_dockerfile_path: p.dev_dockerfile_path,
        };

        let a = self.agent;
        let agent = Agent {
            id: Uuid::new_v4(),
            name: a.name,
            docker_image: a.docker_image,
            docker_host: a.docker_host,
            start_arguments: a.start_arguments,
            continue_arguments: a.continue_arguments,
            workplace_path: a.workplace_path,
            user_id: a.user_id,
            log_processor: a.log_processor,
            env_variables: a.env,
            volumes: a.volumes,
            mcp: a.mcp,
            home_path: a.home_path,
            instructions_mount_path: a.instructions_mount_path,
            ssh_mount_path: a.ssh_mount_path,
        };
        agent
            .validate()
            .with_context(|| format!("agent '{}' is invalid", agent.name))?;

        let mut task = Task::new(project.id, &agent, user.id);
        task.description = self.task.description;
        task.target_branch = self.task.target_branch;
        task.auto_push_enabled = self.task.auto_push_branch.is_some();
        task.auto_push_branch = self.task.auto_push_branch;

        Ok(Records {
            user,
            project,
            agent,
            task,
        })
    }
}
