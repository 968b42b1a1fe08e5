use std::time::Duration;

use rb_core::types::{Agent, Project, RepoState, User};
use rb_runtime::files::{install_ssh_key, write_file};
use rb_runtime::{ContainerConfigBuilder, ContainerHandle, ContainerRuntime, ExecOutput};
use tracing::{debug, info, instrument};

use crate::credentials::{
    askpass_script, ssh_wrapper_script, Credentials, ASKPASS_PATH, SSH_WRAPPER_PATH,
};
use crate::errors::{enhance_error, GitError, Result};

/// Git against a task's workspace, one throwaway container per operation.
///
/// Containers start idle, get credentials written by exec, run the git
/// script by exec and are deleted whatever the outcome.
pub struct GitOperations<'a> {
    runtime: &'a dyn ContainerRuntime,
    builder: &'a ContainerConfigBuilder<'a>,
    agent: &'a Agent,
    project: &'a Project,
    user: &'a User,
    timeout: Duration,
}

/// Where the git command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkDir {
    /// The workspace mount itself; only the initial clone runs here.
    MountRoot,
    Repo,
}

/// Whether the git command talks to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remote {
    Needed,
    Local,
}

struct GitSession<'s> {
    runtime: &'s dyn ContainerRuntime,
    handle: ContainerHandle,
    timeout: Duration,
}

impl GitSession<'_> {
    /// Run `script` with `sh -c`; `args` become `$1..$n`.
    async fn run(
        &self,
        operation: &'static str,
        script: &str,
        args: &[&str],
    ) -> Result<ExecOutput> {
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "git".to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        debug!(container_id = %self.handle.id, operation, "running git");
        tokio::time::timeout(self.timeout, self.runtime.exec(&self.handle, &argv))
            .await
            .map_err(|_| GitError::Timeout {
                operation,
                after: self.timeout,
            })?
            .map_err(GitError::from)
    }

    async fn close(self) {
        self.runtime.cleanup(&self.handle).await;
    }
}

impl<'a> GitOperations<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        builder: &'a ContainerConfigBuilder<'a>,
        agent: &'a Agent,
        project: &'a Project,
        user: &'a User,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            builder,
            agent,
            project,
            user,
            timeout,
        }
    }

    fn repository_url(&self) -> Result<&str> {
        self.project.repository_url().ok_or(GitError::NoRepository)
    }

    fn working_dir(&self, dir: WorkDir) -> String {
        match dir {
            WorkDir::MountRoot => self.builder.workspace_path().to_string(),
            WorkDir::Repo => self.builder.repo_dir(),
        }
    }

    fn credentials(&self, remote: Remote) -> Result<Credentials> {
        match remote {
            Remote::Local => Ok(Credentials::None),
            Remote::Needed => {
                Credentials::for_remote(self.repository_url()?, self.user, self.agent)
            }
        }
    }

    async fn open(&self, dir: WorkDir, remote: Remote) -> Result<GitSession<'a>> {
        // Resolved first so a missing SSH key fails before a container exists.
        let credentials = self.credentials(remote)?;
        let spec = self
            .builder
            .git_op(&self.working_dir(dir), credentials.env());
        let handle = self.runtime.create(&spec).await?;
        let session = GitSession {
            runtime: self.runtime,
            handle,
            timeout: self.timeout,
        };

        match self.prepare(&session.handle, &credentials).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, handle: &ContainerHandle, credentials: &Credentials) -> Result<()> {
        self.runtime.start(handle).await?;
        match credentials {
            Credentials::None => {}
            Credentials::Token(_) => {
                write_file(self.runtime, handle, ASKPASS_PATH, askpass_script(), "700").await?;
            }
            Credentials::Ssh { key, dir } => {
                let key_path = install_ssh_key(self.runtime, handle, dir, key).await?;
                write_file(
                    self.runtime,
                    handle,
                    SSH_WRAPPER_PATH,
                    &ssh_wrapper_script(&key_path),
                    "700",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Open a session, run one script and always tear the container down.
    async fn run_once(
        &self,
        operation: &'static str,
        dir: WorkDir,
        remote: Remote,
        script: &str,
        args: &[&str],
    ) -> Result<String> {
        let session = self.open(dir, remote).await?;
        let result = session.run(operation, script, args).await;
        session.close().await;
        self.check(operation, result?)
    }

    fn check(&self, operation: &'static str, out: ExecOutput) -> Result<String> {
        if out.success() {
            return Ok(out.stdout);
        }
        let stderr = if out.stderr.trim().is_empty() {
            &out.stdout
        } else {
            &out.stderr
        };
        Err(GitError::CommandFailed {
            operation,
            message: enhance_error(stderr, self.user, self.agent),
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Clone into the project's repo subpath (or the mount root when blank).
    #[instrument(skip(self), fields(project = %self.project.name))]
    pub async fn clone_repo(&self) -> Result<()> {
        let url = self.repository_url()?;
        let dest = match self.project.repo_subpath() {
            "" => ".",
            sub => sub,
        };
        self.run_once(
            "clone",
            WorkDir::MountRoot,
            Remote::Needed,
            r#"git clone "$1" "$2""#,
            &[url, dest],
        )
        .await?;
        info!(dest, "repository cloned");
        Ok(())
    }

    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run_once(
                "current_branch",
                WorkDir::Repo,
                Remote::Local,
                "git rev-parse --abbrev-ref HEAD",
                &[],
            )
            .await?;
        Ok(out.trim().to_string())
    }

    pub async fn list_branches(&self) -> Result<Vec<String>> {
        let out = self
            .run_once(
                "list_branches",
                WorkDir::Repo,
                Remote::Needed,
                "git ls-remote --heads origin",
                &[],
            )
            .await?;
        Ok(parse_heads(&out))
    }

    /// The remote's HEAD branch, if the remote advertises one.
    pub async fn default_branch(&self) -> Result<Option<String>> {
        let out = self
            .run_once(
                "default_branch",
                WorkDir::Repo,
                Remote::Needed,
                "git ls-remote --symref origin HEAD",
                &[],
            )
            .await?;
        Ok(parse_symref_head(&out))
    }

    /// Working-tree changes against HEAD, untracked files included.
    pub async fn uncommitted_diff(&self) -> Result<String> {
        self.run_once(
            "uncommitted_diff",
            WorkDir::Repo,
            Remote::Local,
            UNCOMMITTED_DIFF,
            &[],
        )
        .await
    }

    pub async fn target_branch_diff(&self, branch: &str) -> Result<String> {
        self.run_once(
            "target_branch_diff",
            WorkDir::Repo,
            Remote::Local,
            TARGET_DIFF,
            &[branch],
        )
        .await
    }

    /// Both diffs from one container.
    pub async fn capture_repo_state(&self, target_branch: Option<&str>) -> Result<RepoState> {
        let session = self.open(WorkDir::Repo, Remote::Local).await?;
        let result = async {
            let uncommitted = self.check(
                "uncommitted_diff",
                session.run("uncommitted_diff", UNCOMMITTED_DIFF, &[]).await?,
            )?;
            let target = match target_branch {
                Some(branch) => self.check(
                    "target_branch_diff",
                    session.run("target_branch_diff", TARGET_DIFF, &[branch]).await?,
                )?,
                None => String::new(),
            };
            Ok::<_, GitError>((uncommitted, target))
        }
        .await;
        session.close().await;

        let (uncommitted_diff, target_branch_diff) = result?;
        Ok(RepoState {
            uncommitted_diff,
            target_branch_diff,
            repository_path: self.builder.repo_dir(),
        })
    }

    /// Commit anything uncommitted with `message` and push HEAD to `branch`.
    #[instrument(skip(self, message))]
    pub async fn push(&self, branch: &str, message: &str) -> Result<()> {
        self.run_once(
            "push",
            WorkDir::Repo,
            Remote::Needed,
            r#"git add -A && (git diff --cached --quiet || git commit -q -m "$1") && git push origin "HEAD:$2""#,
            &[message, branch],
        )
        .await?;
        info!(branch, "pushed");
        Ok(())
    }
}

const UNCOMMITTED_DIFF: &str = "git add -A -N && git diff HEAD";
const TARGET_DIFF: &str = r#"git diff "$1""#;

fn parse_heads(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect()
}

fn parse_symref_head(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.strip_prefix("ref:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .find_map(|r| r.strip_prefix("refs/heads/"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ls_remote_heads() {
        let out = "a1b2\trefs/heads/main\nc3d4\trefs/heads/feature/x\n";
        assert_eq!(parse_heads(out), vec!["main", "feature/x"]);
    }

    #[test]
    fn parses_symref() {
        let out = "ref: refs/heads/trunk\tHEAD\n0123abcd\tHEAD\n";
        assert_eq!(parse_symref_head(out).as_deref(), Some("trunk"));
        assert_eq!(parse_symref_head("0123\tHEAD\n"), None);
    }
}
