//! Credential injection for git remotes.
//!
//! Tokens reach git through an askpass script that reads `$GIT_TOKEN` from the
//! container environment; SSH keys are installed by exec and used through a
//! wrapper named by `GIT_SSH`. Neither ever appears in a command string.

use rb_core::types::{Agent, User};

use crate::errors::{GitError, Result};

pub const ASKPASS_PATH: &str = "/tmp/git-askpass.sh";
pub const SSH_WRAPPER_PATH: &str = "/tmp/git-ssh.sh";
pub const TOKEN_ENV: &str = "GIT_TOKEN";

const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  Username*) echo "x-access-token" ;;
  Password*) echo "$GIT_TOKEN" ;;
esac
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// `https://github.com/...`
    GithubHttps,
    /// `git@host:...` or `ssh://...`
    Ssh,
    Other,
}

impl RemoteKind {
    pub fn of(url: &str) -> Self {
        let url = url.trim();
        if url.starts_with("https://github.com/") {
            RemoteKind::GithubHttps
        } else if url.starts_with("git@") || url.starts_with("ssh://") {
            RemoteKind::Ssh
        } else {
            RemoteKind::Other
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Token(String),
    Ssh { key: String, dir: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Token(_) => f.write_str("Token([REDACTED])"),
            Credentials::Ssh { dir, .. } => write!(f, "Ssh {{ dir: {dir:?} }}"),
        }
    }
}

impl Credentials {
    /// Pick credentials for `url`. SSH remotes without a key or mount path
    /// fail here, before any container exists.
    pub fn for_remote(url: &str, user: &User, agent: &Agent) -> Result<Self> {
        match RemoteKind::of(url) {
            RemoteKind::GithubHttps => Ok(user
                .github_token()
                .map(|t| Credentials::Token(t.trim().to_string()))
                .unwrap_or(Credentials::None)),
            RemoteKind::Ssh => {
                let key = user.ssh_key().ok_or_else(|| {
                    GitError::CredentialMissing(
                        "Repository uses SSH but no SSH key is configured for your account. \
                         Add a private key in your settings."
                            .into(),
                    )
                })?;
                let dir = agent.ssh_mount_path.as_deref().ok_or_else(|| {
                    GitError::CredentialMissing(format!(
                        "Repository uses SSH but agent '{}' has no SSH mount path configured.",
                        agent.name
                    ))
                })?;
                Ok(Credentials::Ssh {
                    key: key.to_string(),
                    dir: dir.to_string(),
                })
            }
            RemoteKind::Other => Ok(Credentials::None),
        }
    }

    /// Environment for the git container.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec!["GIT_TERMINAL_PROMPT=0".to_string()];
        match self {
            Credentials::None => {}
            Credentials::Token(token) => {
                env.push(format!("GIT_ASKPASS={ASKPASS_PATH}"));
                env.push(format!("{TOKEN_ENV}={token}"));
            }
            Credentials::Ssh { .. } => env.push(format!("GIT_SSH={SSH_WRAPPER_PATH}")),
        }
        env
    }
}

pub fn askpass_script() -> &'static str {
    ASKPASS_SCRIPT
}

pub fn ssh_wrapper_script(key_path: &str) -> String {
    format!(
        "#!/bin/sh\nexec ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \"$@\"\n",
        shell_quote(key_path)
    )
}

/// Single-quote `s` for POSIX sh.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
