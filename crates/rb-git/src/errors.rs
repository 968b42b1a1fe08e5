use std::time::Duration;

use rb_core::types::{Agent, User};
use rb_runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Credentials needed for the remote are not configured. Raised before
    /// any container is created.
    #[error("{0}")]
    CredentialMissing(String),
    #[error("git {operation} failed: {message}")]
    CommandFailed {
        operation: &'static str,
        message: String,
    },
    #[error("git {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("project has no repository URL")]
    NoRepository,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, GitError>;

const SSH_FAILURE_PATTERNS: [&str; 2] = [
    "Permission denied (publickey)",
    "Could not read from remote repository",
];

/// Turn git's stderr into an actionable message when it is a known SSH
/// authentication failure; otherwise return it as-is.
pub fn enhance_error(stderr: &str, user: &User, agent: &Agent) -> String {
    if !SSH_FAILURE_PATTERNS.iter().any(|p| stderr.contains(p)) {
        return stderr.trim().to_string();
    }
    if user.ssh_key().is_none() {
        "SSH authentication failed: no SSH key is configured for your account. \
         Add a private key with access to this repository in your settings."
            .to_string()
    } else if agent.ssh_mount_path.is_none() {
        format!(
            "SSH authentication failed: agent '{}' has no SSH mount path configured, \
             so your key could not be installed in the container.",
            agent.name
        )
    } else {
        "SSH authentication failed: your SSH key does not have access to this repository. \
         Check that the key is added to the repository host with read/write access."
            .to_string()
    }
}
