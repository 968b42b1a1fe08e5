use std::collections::BTreeMap;

use rb_core::types::*;
use uuid::Uuid;

fn agent() -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "claude".into(),
        docker_image: "runbox/claude:latest".into(),
        docker_host: None,
        start_arguments: vec!["echo".into(), "{PROMPT}".into()],
        continue_arguments: vec!["claude".into(), "--continue".into(), "-p".into(), "{PROMPT}".into()],
        workplace_path: "/workspace".into(),
        user_id: Some(1000),
        log_processor: LogProcessorKind::Auto,
        env_variables: BTreeMap::new(),
        volumes: vec![AgentVolume {
            name: "home".into(),
            path: "/home/agent".into(),
        }],
        mcp: None,
        home_path: Some("/home/agent".into()),
        instructions_mount_path: None,
        ssh_mount_path: None,
    }
}

#[test]
fn run_status_transitions() {
    assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
    assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
    assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
    assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
    assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
    assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
    assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
}

#[test]
fn set_status_stamps_start_and_rejects_bad_moves() {
    let mut run = Run::new(Uuid::new_v4(), "hi");
    run.set_status(RunStatus::Running).unwrap();
    assert!(run.started_at.is_some());
    run.set_status(RunStatus::Failed).unwrap();
    let err = run.set_status(RunStatus::Completed).unwrap_err();
    assert_eq!(err.from, RunStatus::Failed);
    assert_eq!(run.status, RunStatus::Failed);
}

#[test]
fn prompt_substituted_in_every_argument() {
    let mut agent = agent();
    agent.start_arguments = vec!["run".into(), "{PROMPT}".into(), "--again={PROMPT}".into()];
    assert_eq!(
        agent.command_for("hi", true),
        vec!["run", "hi", "--again=hi"]
    );
}

#[test]
fn continuation_uses_continue_arguments() {
    let agent = agent();
    assert_eq!(agent.command_for("hi", true), vec!["echo", "hi"]);
    assert_eq!(
        agent.command_for("more", false),
        vec!["claude", "--continue", "-p", "more"]
    );

    let mut no_continue = agent;
    no_continue.continue_arguments.clear();
    assert_eq!(no_continue.command_for("more", false), vec!["echo", "more"]);
}

#[test]
fn task_gets_workspace_and_named_volumes() {
    let agent = agent();
    let task = Task::new(Uuid::new_v4(), &agent, Uuid::new_v4());
    assert_eq!(task.volume_mounts.len(), 2);

    let workspace = task.workspace_mount().unwrap();
    assert_eq!(workspace.container_path, "/workspace");
    assert!(workspace.volume_id.ends_with("_workspace"));

    let binds = task.volume_binds();
    assert_eq!(binds[0], format!("{}:/workspace", workspace.volume_id));
    assert!(binds[1].ends_with("_home:/home/agent"));
}

#[test]
fn auto_push_target_requires_flag_and_branch() {
    let mut task = Task::new(Uuid::new_v4(), &agent(), Uuid::new_v4());
    task.auto_push_branch = Some("feature".into());
    assert_eq!(task.auto_push_target(), None);
    task.auto_push_enabled = true;
    assert_eq!(task.auto_push_target(), Some("feature"));
    task.auto_push_branch = Some("  ".into());
    assert_eq!(task.auto_push_target(), None);
}

#[test]
fn first_run_is_earliest_sibling() {
    let task_id = Uuid::new_v4();
    let first = Run::new(task_id, "a");
    let second = Run::new(task_id, "b");
    let siblings = vec![first.clone(), second.clone()];
    assert!(first.is_first_run(&siblings));
    assert!(!second.is_first_run(&siblings));
    assert!(second.is_first_run(&[]));
}

#[test]
fn repo_dir_strips_leading_slash() {
    let mut project = Project {
        id: Uuid::new_v4(),
        name: "p".into(),
        repository_url: Some("https://github.com/o/r.git".into()),
        repo_path: "/app".into(),
        default_branch: None,
        setup_script: None,
        secrets: BTreeMap::new(),
        dev_dockerfile_path: None,
    };
    assert_eq!(project.repo_dir("/workspace"), "/workspace/app");
    project.repo_path = String::new();
    assert_eq!(project.repo_dir("/workspace"), "/workspace");
    assert_eq!(join_container_path("/workspace/", "a/b"), "/workspace/a/b");
}

#[test]
fn unknown_log_processor_fails_at_parse_time() {
    assert_eq!(
        "ClaudeStreamingJson".parse::<LogProcessorKind>().unwrap(),
        LogProcessorKind::ClaudeStreamingJson
    );
    assert!("Yaml".parse::<LogProcessorKind>().is_err());

    let json = serde_json::json!({
        "id": Uuid::new_v4(),
        "name": "bad",
        "docker_image": "img",
        "start_arguments": ["x"],
        "workplace_path": "/w",
        "log_processor": "Yaml"
    });
    let err = serde_json::from_value::<Agent>(json).unwrap_err();
    assert!(err.to_string().contains("unknown log processor"));
}

#[test]
fn agent_validation() {
    assert!(agent().validate().is_ok());

    let mut a = agent();
    a.docker_image = " ".into();
    assert!(matches!(a.validate(), Err(AgentValidationError::MissingImage(_))));

    let mut a = agent();
    a.start_arguments.clear();
    assert!(matches!(
        a.validate(),
        Err(AgentValidationError::MissingStartArguments(_))
    ));

    let mut a = agent();
    a.ssh_mount_path = Some("ssh".into());
    assert_eq!(
        a.validate(),
        Err(AgentValidationError::RelativePath("ssh".into()))
    );

    let mut a = agent();
    a.volumes.push(AgentVolume {
        name: "home".into(),
        path: "/other".into(),
    });
    assert_eq!(
        a.validate(),
        Err(AgentValidationError::DuplicateVolume("home".into()))
    );
}

#[test]
fn user_debug_redacts_credentials() {
    let mut user = User::new("dev");
    user.github_token = Some("ghp_secret".into());
    user.api_token = Some("api_secret".into());
    let rendered = format!("{user:?}");
    assert!(!rendered.contains("ghp_secret"));
    assert!(!rendered.contains("api_secret"));
    assert!(rendered.contains("[REDACTED]"));
}

#[test]
fn repo_state_changes() {
    let state = RepoState {
        uncommitted_diff: "\n".into(),
        target_branch_diff: String::new(),
        repository_path: "/workspace".into(),
    };
    assert!(!state.has_changes());
    let state = RepoState {
        target_branch_diff: "diff --git a/x b/x".into(),
        ..state
    };
    assert!(state.has_changes());
}
