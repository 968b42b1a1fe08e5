use rb_core::store::StoreError;
use rb_core::types::StatusTransitionError;
use rb_git::GitError;
use rb_runtime::RuntimeError;

/// Why a run (or one of its phases) went wrong.
///
/// Fatal variants fail the run; best-effort and parse failures are recorded
/// on the timeline and the run carries on.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Clone, setup script, MCP registration or the agent container failed.
    #[error("{0}")]
    FatalSetup(String),
    /// SSH or token credentials the repository needs are not configured.
    #[error("{0}")]
    CredentialMissing(String),
    /// Malformed agent output. Degrades to an error step.
    #[error("could not parse agent output: {0}")]
    ParseFailure(String),
    /// Auto-push, repository capture, cleanup or old-image removal failed.
    #[error("{0}")]
    BestEffortFailure(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Runtime(RuntimeError),
    #[error(transparent)]
    Git(GitError),
}

pub type Result<T> = std::result::Result<T, RunError>;

impl RunError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RunError::ParseFailure(_) | RunError::BestEffortFailure(_)
        )
    }

    /// Wrap any error as a setup failure of `phase`.
    pub fn setup(phase: &str, err: impl std::fmt::Display) -> Self {
        RunError::FatalSetup(format!("{phase} failed: {err}"))
    }
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => RunError::NotFound {
                entity,
                id: id.to_string(),
            },
            other => RunError::Store(other),
        }
    }
}

impl From<RuntimeError> for RunError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound { target } => RunError::NotFound {
                entity: "container",
                id: target,
            },
            other => RunError::Runtime(other),
        }
    }
}

impl From<GitError> for RunError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::CredentialMissing(message) => RunError::CredentialMissing(message),
            other => RunError::Git(other),
        }
    }
}
