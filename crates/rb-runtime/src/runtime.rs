use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rb_core::config::{parse_endpoint, EndpointAddr};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {target}")]
    NotFound { target: String },
    #[error("{operation} on {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },
    #[error("failed to connect to docker at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
    #[error("docker {operation} failed for {target} on {endpoint}: {message}")]
    Operation {
        endpoint: String,
        operation: &'static str,
        target: String,
        message: String,
    },
    #[error("invalid docker endpoint: {0}")]
    InvalidEndpoint(String),
}

impl RuntimeError {
    /// The container (or image) was already gone. Stop and delete callers
    /// treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ---------------------------------------------------------------------------
// DockerEndpoint
// ---------------------------------------------------------------------------

/// Which Docker daemon an operation targets. Carried by every spec and handle
/// so no shared client is ever repointed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DockerEndpoint {
    #[default]
    Local,
    UnixSocket(String),
    Tcp(String),
}

impl DockerEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        match parse_endpoint(endpoint) {
            Some(EndpointAddr::Unix(path)) => Ok(Self::UnixSocket(path.to_string())),
            Some(EndpointAddr::Tcp(addr)) => Ok(Self::Tcp(addr.to_string())),
            None => Err(RuntimeError::InvalidEndpoint(endpoint.trim().to_string())),
        }
    }

    /// The agent's host wins over the configured default; local defaults
    /// apply when neither is set.
    pub fn resolve(agent_host: Option<&str>, configured: Option<&str>) -> Result<Self> {
        match agent_host
            .filter(|h| !h.trim().is_empty())
            .or(configured.filter(|h| !h.trim().is_empty()))
        {
            Some(endpoint) => Self::parse(endpoint),
            None => Ok(Self::Local),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Local => "local-docker-daemon".to_owned(),
            Self::UnixSocket(path) => format!("unix://{path}"),
            Self::Tcp(addr) => format!("tcp://{addr}"),
        }
    }
}

impl fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// ---------------------------------------------------------------------------
// Specs and handles
// ---------------------------------------------------------------------------

/// Declarative description of a container to create.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub endpoint: DockerEndpoint,
    pub image: String,
    /// `None` keeps the image's entrypoint.
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// `KEY=VALUE` pairs. May carry secrets; never logged by value.
    pub env: Vec<String>,
    /// `volume:container_path` binds.
    pub binds: Vec<String>,
    pub name: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|pair| {
            pair.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("endpoint", &self.endpoint)
            .field("image", &self.image)
            .field("entrypoint", &self.entrypoint)
            .field("cmd", &self.cmd)
            .field("working_dir", &self.working_dir)
            .field("user", &self.user)
            .field("env", &format_args!("[{} vars]", self.env.len()))
            .field("binds", &self.binds)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
    pub endpoint: DockerEndpoint,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, endpoint: DockerEndpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for recording as a step.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerRuntime trait
// ---------------------------------------------------------------------------

/// Abstraction over the container daemon so the engine can be driven by a
/// scripted runtime in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Block until the container exits. `None` waits indefinitely.
    async fn wait(&self, handle: &ContainerHandle, timeout: Option<Duration>)
        -> Result<ExitStatus>;

    /// Combined stdout and stderr, possibly in Docker's framed format.
    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>>;

    /// Run `argv` inside a running container and wait for it to finish.
    async fn exec(&self, handle: &ContainerHandle, argv: &[String]) -> Result<ExecOutput>;

    /// Ask the container to stop (not kill).
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    async fn delete(&self, handle: &ContainerHandle, force: bool) -> Result<()>;

    /// Tar archive of `path` inside the container.
    async fn archive_out(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>>;

    async fn build_image(
        &self,
        endpoint: &DockerEndpoint,
        context_tar: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<()>;

    async fn remove_image(&self, endpoint: &DockerEndpoint, tag: &str) -> Result<()>;

    /// Stop, treating an already-gone container as stopped.
    async fn stop_if_present(&self, handle: &ContainerHandle) -> Result<()> {
        match self.stop(handle).await {
            Err(e) if e.is_not_found() => {
                debug!(container_id = %handle.id, "container already gone on stop");
                Ok(())
            }
            other => other,
        }
    }

    /// Force-delete and swallow every failure.
    async fn cleanup(&self, handle: &ContainerHandle) {
        match self.delete(handle, true).await {
            Ok(()) => debug!(container_id = %handle.id, "container deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container_id = %handle.id, error = %e, "container cleanup failed"),
        }
    }
}
