//! Writing files into running containers through `exec`.
//!
//! Content travels base64-encoded as a positional argument, so nothing is
//! spliced into the shell script itself.

use base64::Engine as _;
use rb_core::types::{Agent, User};
use tracing::{debug, warn};

use crate::runtime::{ContainerHandle, ContainerRuntime, Result, RuntimeError};

/// File name of the private key inside an agent's SSH directory.
pub const SSH_KEY_FILE: &str = "id_rsa";

const WRITE_SCRIPT: &str =
    r#"mkdir -p "$(dirname "$1")" && printf '%s' "$2" | base64 -d > "$1" && chmod "$3" "$1""#;

const PRIVATE_DIR_SCRIPT: &str = r#"mkdir -p "$1" && chmod 700 "$1""#;

fn shell(script: &str, args: &[&str]) -> Vec<String> {
    let mut argv = vec!["sh".to_string(), "-c".to_string(), script.to_string(), "sh".to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

/// `argv` that writes `content` to `path` with the octal `mode`.
pub fn write_file_command(path: &str, content: &str, mode: &str) -> Vec<String> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
    shell(WRITE_SCRIPT, &[path, &encoded, mode])
}

pub fn private_dir_command(path: &str) -> Vec<String> {
    shell(PRIVATE_DIR_SCRIPT, &[path])
}

fn check(
    handle: &ContainerHandle,
    operation: &'static str,
    target: &str,
    exit_code: i64,
    stderr: &str,
) -> Result<()> {
    if exit_code == 0 {
        return Ok(());
    }
    Err(RuntimeError::Operation {
        endpoint: handle.endpoint.label(),
        operation,
        target: target.to_string(),
        message: format!("exit code {exit_code}: {}", stderr.trim()),
    })
}

pub async fn write_file(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    path: &str,
    content: &str,
    mode: &str,
) -> Result<()> {
    let out = runtime
        .exec(handle, &write_file_command(path, content, mode))
        .await?;
    check(handle, "write_file", path, out.exit_code, &out.stderr)?;
    debug!(container_id = %handle.id, path, mode, bytes = content.len(), "file written");
    Ok(())
}

/// Create `path` if missing and restrict it to its owner.
pub async fn ensure_private_dir(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    path: &str,
) -> Result<()> {
    let out = runtime.exec(handle, &private_dir_command(path)).await?;
    check(handle, "ensure_private_dir", path, out.exit_code, &out.stderr)
}

/// Write a private key into `dir` (700) as `dir/id_rsa` (600) and return the
/// key path.
pub async fn install_ssh_key(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    dir: &str,
    key: &str,
) -> Result<String> {
    ensure_private_dir(runtime, handle, dir).await?;
    let path = ssh_key_path(dir);
    let mut key = key.to_string();
    if !key.ends_with('\n') {
        key.push('\n');
    }
    write_file(runtime, handle, &path, &key, "600").await?;
    Ok(path)
}

pub fn ssh_key_path(dir: &str) -> String {
    format!("{}/{SSH_KEY_FILE}", dir.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Agent container provisioning
// ---------------------------------------------------------------------------

/// A file the agent container should see once it is running.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionedFile {
    pub path: String,
    pub content: String,
    pub mode: &'static str,
}

impl std::fmt::Debug for ProvisionedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedFile")
            .field("path", &self.path)
            .field("bytes", &self.content.len())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Git config and instructions for the agent container. The SSH key is
/// installed separately because its directory needs tightening first.
pub fn agent_files(agent: &Agent, user: &User) -> Vec<ProvisionedFile> {
    let mut files = Vec::new();
    if let (Some(home), Some(config)) = (agent.home_path.as_deref(), user.git_config.as_deref()) {
        if !config.trim().is_empty() {
            files.push(ProvisionedFile {
                path: format!("{}/.gitconfig", home.trim_end_matches('/')),
                content: config.to_string(),
                mode: "644",
            });
        }
    }
    if let (Some(path), Some(instructions)) = (
        agent.instructions_mount_path.as_deref(),
        user.instructions.as_deref(),
    ) {
        if !instructions.trim().is_empty() {
            files.push(ProvisionedFile {
                path: path.to_string(),
                content: instructions.to_string(),
                mode: "644",
            });
        }
    }
    files
}

/// Write every agent file into a started container. Failures are logged and
/// skipped; the agent process is already running.
pub async fn provision_agent_container(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    agent: &Agent,
    user: &User,
) -> usize {
    let mut written = 0;
    for file in agent_files(agent, user) {
        match write_file(runtime, handle, &file.path, &file.content, file.mode).await {
            Ok(()) => written += 1,
            Err(e) => warn!(
                container_id = %handle.id,
                path = %file.path,
                error = %e,
                "file provisioning failed"
            ),
        }
    }
    if let (Some(dir), Some(key)) = (agent.ssh_mount_path.as_deref(), user.ssh_key()) {
        match install_ssh_key(runtime, handle, dir, key).await {
            Ok(_) => written += 1,
            Err(e) => warn!(container_id = %handle.id, error = %e, "ssh key provisioning failed"),
        }
    }
    written
}
