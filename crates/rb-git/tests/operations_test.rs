use std::collections::BTreeMap;
use std::time::Duration;

use rb_core::types::{Agent, Project, Task, User};
use rb_git::{GitError, GitOperations};
use rb_runtime::fake::{FakeEvent, FakeRuntime};
use rb_runtime::{ContainerConfigBuilder, DockerEndpoint, ExecOutput};
use uuid::Uuid;

struct Fixture {
    agent: Agent,
    project: Project,
    user: User,
    task: Task,
}

fn fixture(url: &str, repo_path: &str) -> Fixture {
    let agent = Agent {
        id: Uuid::new_v4(),
        name: "claude".into(),
        docker_image: "agent:1".into(),
        docker_host: None,
        start_arguments: vec!["run".into()],
        continue_arguments: vec![],
        workplace_path: "/workspace".into(),
        user_id: Some(1000),
        log_processor: Default::default(),
        env_variables: BTreeMap::new(),
        volumes: vec![],
        mcp: None,
        home_path: Some("/home/agent".into()),
        instructions_mount_path: None,
        ssh_mount_path: Some("/home/agent/.ssh".into()),
    };
    let project = Project {
        id: Uuid::new_v4(),
        name: "demo".into(),
        repository_url: Some(url.into()),
        repo_path: repo_path.into(),
        default_branch: None,
        setup_script: None,
        secrets: BTreeMap::new(),
        dev_dockerfile_path: None,
    };
    let user = User::new("dev");
    let task = Task::new(project.id, &agent, user.id);
    Fixture {
        agent,
        project,
        user,
        task,
    }
}

fn failing(stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 128,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn https_clone_uses_askpass_and_env_token() {
    let mut f = fixture("https://github.com/acme/app.git", "");
    f.user.github_token = Some("ghp_SECRET".into());
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    git.clone_repo().await.unwrap();

    let specs = rt.created_with_purpose("git-op");
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].working_dir.as_deref(), Some("/workspace"));
    assert_eq!(specs[0].env_value("GIT_TOKEN"), Some("ghp_SECRET"));
    assert_eq!(specs[0].env_value("GIT_ASKPASS"), Some("/tmp/git-askpass.sh"));
    assert_eq!(specs[0].env_value("GIT_TERMINAL_PROMPT"), Some("0"));

    let calls = rt.exec_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0][4], "/tmp/git-askpass.sh");
    let clone = &calls[1];
    assert_eq!(&clone[4..], &["https://github.com/acme/app.git", "."]);
    for call in &calls {
        assert!(call.iter().all(|a| !a.contains("ghp_SECRET")));
    }
    assert_eq!(rt.deleted().len(), 1);
}

#[tokio::test]
async fn clone_into_subpath_runs_at_mount_root() {
    let f = fixture("https://gitlab.com/acme/app.git", "/services/api");
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    git.clone_repo().await.unwrap();

    let spec = &rt.created_with_purpose("git-op")[0];
    assert_eq!(spec.working_dir.as_deref(), Some("/workspace"));
    assert!(spec.env_value("GIT_TOKEN").is_none());
    let calls = rt.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][5], "services/api");
}

#[tokio::test]
async fn ssh_without_key_fails_before_container() {
    let f = fixture("git@github.com:acme/app.git", "");
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    let err = git.clone_repo().await.unwrap_err();
    assert!(matches!(err, GitError::CredentialMissing(_)));
    assert!(rt.created().is_empty());
}

#[tokio::test]
async fn ssh_without_mount_path_fails_before_container() {
    let mut f = fixture("ssh://git@host/acme/app.git", "");
    f.user.ssh_key = Some("KEY".into());
    f.agent.ssh_mount_path = None;
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    let err = git.push("main", "msg").await.unwrap_err();
    assert!(err.to_string().contains("no SSH mount path"));
    assert!(rt.created().is_empty());
}

#[tokio::test]
async fn ssh_clone_installs_key_and_wrapper() {
    let mut f = fixture("git@github.com:acme/app.git", "");
    f.user.ssh_key = Some("-----BEGIN KEY-----\nabc\n-----END KEY-----".into());
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    git.clone_repo().await.unwrap();

    let spec = &rt.created_with_purpose("git-op")[0];
    assert_eq!(spec.env_value("GIT_SSH"), Some("/tmp/git-ssh.sh"));
    let calls = rt.exec_calls();
    let targets: Vec<_> = calls.iter().map(|c| c[4].as_str()).collect();
    assert_eq!(
        targets,
        vec![
            "/home/agent/.ssh",
            "/home/agent/.ssh/id_rsa",
            "/tmp/git-ssh.sh",
            "git@github.com:acme/app.git"
        ]
    );
    assert_eq!(calls[1][6], "600");
}

#[tokio::test]
async fn auth_failure_is_enhanced_and_container_deleted() {
    let mut f = fixture("git@github.com:acme/app.git", "");
    f.user.ssh_key = Some("KEY".into());
    let rt = FakeRuntime::new();
    rt.script_exec(
        "git clone",
        failing("git@github.com: Permission denied (publickey).\nfatal: Could not read from remote repository."),
    );
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    let err = git.clone_repo().await.unwrap_err();
    assert!(err.to_string().contains("does not have access"));
    assert_eq!(rt.deleted().len(), 1);
}

#[tokio::test]
async fn raw_stderr_surfaces_for_other_failures() {
    let f = fixture("https://gitlab.com/acme/app.git", "");
    let rt = FakeRuntime::new();
    rt.script_exec("git clone", failing("fatal: repository 'x' not found\n"));
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    let err = git.clone_repo().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "git clone failed: fatal: repository 'x' not found"
    );
}

#[tokio::test]
async fn branch_queries() {
    let f = fixture("https://gitlab.com/acme/app.git", "app");
    let rt = FakeRuntime::new();
    rt.script_exec("rev-parse", ok("develop\n"));
    rt.script_exec("--heads", ok("a\trefs/heads/main\nb\trefs/heads/develop\n"));
    rt.script_exec("--symref", ok("ref: refs/heads/main\tHEAD\nabc\tHEAD\n"));
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    assert_eq!(git.current_branch().await.unwrap(), "develop");
    assert_eq!(git.list_branches().await.unwrap(), vec!["main", "develop"]);
    assert_eq!(git.default_branch().await.unwrap().as_deref(), Some("main"));

    for spec in rt.created_with_purpose("git-op") {
        assert_eq!(spec.working_dir.as_deref(), Some("/workspace/app"));
    }
    assert_eq!(rt.deleted().len(), 3);
}

#[tokio::test]
async fn repo_state_uses_one_container() {
    let f = fixture("https://gitlab.com/acme/app.git", "");
    let rt = FakeRuntime::new();
    rt.script_exec("diff HEAD", ok("diff --git a/x b/x\n+new\n"));
    rt.script_exec("git diff \"$1\"", ok(""));
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    let state = git.capture_repo_state(Some("main")).await.unwrap();
    assert!(state.uncommitted_diff.contains("+new"));
    assert!(state.target_branch_diff.is_empty());
    assert_eq!(state.repository_path, "/workspace");
    assert_eq!(rt.created().len(), 1);

    let calls = rt.exec_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1][4], "main");
}

#[tokio::test]
async fn push_commits_then_pushes_branch() {
    let mut f = fixture("https://github.com/acme/app.git", "");
    f.user.github_token = Some("ghp_T".into());
    let rt = FakeRuntime::new();
    let builder =
        ContainerConfigBuilder::new(&f.agent, &f.project, &f.user, &f.task, DockerEndpoint::Local);
    let git = GitOperations::new(&rt, &builder, &f.agent, &f.project, &f.user, TIMEOUT);

    git.push("feature/x", "Auto-commit").await.unwrap();

    let calls = rt.exec_calls();
    let push = calls.last().unwrap();
    assert!(push[2].contains("git push origin \"HEAD:$2\""));
    assert_eq!(&push[4..], &["Auto-commit", "feature/x"]);
    assert!(matches!(rt.events().last(), Some(FakeEvent::Delete(_))));
}
