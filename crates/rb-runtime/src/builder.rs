use std::collections::BTreeMap;
use std::fmt;

use rb_core::types::{Agent, Project, Task, User};

use crate::runtime::{ContainerSpec, DockerEndpoint};

/// Shell loop that keeps a container alive until it is stopped.
pub const IDLE_SCRIPT: &str = "trap 'exit 0' TERM INT; while :; do sleep 1; done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerPurpose {
    Setup,
    McpRegister,
    AgentRun,
    GitOp,
    Build,
}

impl ContainerPurpose {
    pub fn label(&self) -> &'static str {
        match self {
            ContainerPurpose::Setup => "setup",
            ContainerPurpose::McpRegister => "mcp-register",
            ContainerPurpose::AgentRun => "agent-run",
            ContainerPurpose::GitOp => "git-op",
            ContainerPurpose::Build => "docker-build",
        }
    }
}

impl fmt::Display for ContainerPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Produces the container spec for each phase of a run.
///
/// Binds and the base environment are computed once, so every container of
/// a run sees the same volumes and variables.
pub struct ContainerConfigBuilder<'a> {
    agent: &'a Agent,
    project: &'a Project,
    task: &'a Task,
    endpoint: DockerEndpoint,
    binds: Vec<String>,
    env: Vec<String>,
}

impl<'a> ContainerConfigBuilder<'a> {
    pub fn new(
        agent: &'a Agent,
        project: &'a Project,
        user: &'a User,
        task: &'a Task,
        endpoint: DockerEndpoint,
    ) -> Self {
        let mut env = agent.env_list();
        env.extend(project.secret_env());
        if user.allow_github_token_access {
            if let Some(token) = user.github_token() {
                env.push(format!("GITHUB_TOKEN={token}"));
            }
        }

        Self {
            agent,
            project,
            task,
            endpoint,
            binds: task.volume_binds(),
            env,
        }
    }

    pub fn binds(&self) -> &[String] {
        &self.binds
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn endpoint(&self) -> &DockerEndpoint {
        &self.endpoint
    }

    /// Container path of the task's workspace volume.
    pub fn workspace_path(&self) -> &str {
        self.task
            .workspace_mount()
            .map(|m| m.container_path.as_str())
            .unwrap_or(&self.agent.workplace_path)
    }

    /// Repository directory inside the workspace.
    pub fn repo_dir(&self) -> String {
        self.project.repo_dir(self.workspace_path())
    }

    /// The task's dev image when one has been built, the agent's otherwise.
    pub fn image(&self) -> &str {
        self.task
            .dev_image
            .as_deref()
            .unwrap_or(&self.agent.docker_image)
    }

    fn base(&self, purpose: ContainerPurpose) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert("runbox.task".to_string(), self.task.id.to_string());
        labels.insert("runbox.purpose".to_string(), purpose.label().to_string());
        ContainerSpec {
            endpoint: self.endpoint.clone(),
            image: self.image().to_string(),
            entrypoint: None,
            cmd: Vec::new(),
            working_dir: Some(self.repo_dir()),
            user: self.agent.user_id.map(|uid| uid.to_string()),
            env: self.env.clone(),
            binds: self.binds.clone(),
            name: None,
            labels,
        }
    }

    /// Runs the project's setup script with `sh -c` in the repository.
    pub fn setup(&self, script: &str) -> ContainerSpec {
        ContainerSpec {
            entrypoint: Some(vec!["sh".into(), "-c".into()]),
            cmd: vec![script.to_string()],
            ..self.base(ContainerPurpose::Setup)
        }
    }

    pub fn mcp_register(&self, argv: Vec<String>) -> ContainerSpec {
        ContainerSpec {
            cmd: argv,
            ..self.base(ContainerPurpose::McpRegister)
        }
    }

    /// Main agent container; `cmd` is the substituted argument list.
    pub fn agent_run(&self, cmd: Vec<String>) -> ContainerSpec {
        ContainerSpec {
            cmd,
            ..self.base(ContainerPurpose::AgentRun)
        }
    }

    /// Idle container that git commands are exec'd into. `extra_env` is
    /// appended to the base environment.
    pub fn git_op(&self, working_dir: &str, extra_env: Vec<String>) -> ContainerSpec {
        let mut spec = self.base(ContainerPurpose::GitOp);
        spec.entrypoint = Some(vec!["sh".into(), "-c".into()]);
        spec.cmd = vec![IDLE_SCRIPT.to_string()];
        spec.working_dir = Some(working_dir.to_string());
        spec.env.extend(extra_env);
        spec
    }

    /// Container that is only created to read the workspace; never started.
    pub fn build(&self) -> ContainerSpec {
        ContainerSpec {
            cmd: vec!["true".into()],
            ..self.base(ContainerPurpose::Build)
        }
    }
}
