use std::collections::BTreeMap;

use rb_core::sqlite_store::SqliteStore;
use rb_core::store::{MemoryStore, RunStore, StoreError};
use rb_core::types::*;
use uuid::Uuid;

fn agent() -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "echo".into(),
        docker_image: "alpine:3".into(),
        docker_host: None,
        start_arguments: vec!["echo".into(), "{PROMPT}".into()],
        continue_arguments: vec![],
        workplace_path: "/workspace".into(),
        user_id: None,
        log_processor: LogProcessorKind::Text,
        env_variables: BTreeMap::new(),
        volumes: vec![],
        mcp: None,
        home_path: None,
        instructions_mount_path: None,
        ssh_mount_path: None,
    }
}

async fn seed(store: &dyn RunStore) -> Task {
    let agent = agent();
    let user = User::new("dev");
    store.insert_agent(&agent).await.unwrap();
    store.insert_user(&user).await.unwrap();
    let task = Task::new(Uuid::new_v4(), &agent, user.id);
    store.insert_task(&task).await.unwrap();
    task
}

async fn runs_and_steps_keep_creation_order(store: &dyn RunStore) {
    let task = seed(store).await;
    let runs: Vec<Run> = (0..3).map(|i| Run::new(task.id, format!("p{i}"))).collect();
    for run in &runs {
        store.insert_run(run).await.unwrap();
    }
    let listed = store.runs_for_task(task.id).await.unwrap();
    let prompts: Vec<_> = listed.iter().map(|r| r.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["p0", "p1", "p2"]);

    for i in 0..5 {
        let step = Step::new(runs[1].id, StepKind::Text, format!("raw{i}"), None);
        store.insert_step(&step).await.unwrap();
    }
    let steps = store.steps_for_run(runs[1].id).await.unwrap();
    let raws: Vec<_> = steps.iter().map(|s| s.raw_response.as_str()).collect();
    assert_eq!(raws, vec!["raw0", "raw1", "raw2", "raw3", "raw4"]);
    assert!(store.steps_for_run(runs[0].id).await.unwrap().is_empty());
}

async fn update_run_persists_status(store: &dyn RunStore) {
    let task = seed(store).await;
    let mut run = Run::new(task.id, "go");
    store.insert_run(&run).await.unwrap();
    run.set_status(RunStatus::Running).unwrap();
    run.container_id = Some("abc".into());
    store.update_run(&run).await.unwrap();

    let fetched = store.get_run(run.id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Running);
    assert_eq!(fetched.container_id.as_deref(), Some("abc"));
}

async fn archive_refused_while_running(store: &dyn RunStore) {
    let task = seed(store).await;
    let mut run = Run::new(task.id, "go");
    run.set_status(RunStatus::Running).unwrap();
    store.insert_run(&run).await.unwrap();

    let err = store.archive_task(task.id).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    run.set_status(RunStatus::Completed).unwrap();
    store.update_run(&run).await.unwrap();
    let archived = store.archive_task(task.id).await.unwrap();
    assert!(archived.is_archived());
    assert!(store.get_task(task.id).await.unwrap().is_archived());
}

async fn missing_records_are_not_found(store: &dyn RunStore) {
    let id = Uuid::new_v4();
    assert!(matches!(
        store.get_run(id).await,
        Err(StoreError::NotFound { entity: "run", .. })
    ));
    let orphan = Step::system(id, "nobody home");
    assert!(store.insert_step(&orphan).await.is_err());
    let run = Run::new(Uuid::new_v4(), "x");
    assert!(store.update_run(&run).await.is_err());
}

async fn step_documents_round_trip(store: &dyn RunStore) {
    let task = seed(store).await;
    let run = Run::new(task.id, "go");
    store.insert_run(&run).await.unwrap();
    let step = Step::system(run.id, "Repository changes captured").with_repo_state(RepoState {
        uncommitted_diff: "diff --git a/a b/a".into(),
        target_branch_diff: String::new(),
        repository_path: "/workspace".into(),
    });
    store.insert_step(&step).await.unwrap();
    let call = Step::new(run.id, StepKind::ToolCall, "{}", Some("name: Bash".into()))
        .with_tool_use_id(Some("toolu_1".into()));
    store.insert_step(&call).await.unwrap();

    let steps = store.steps_for_run(run.id).await.unwrap();
    assert_eq!(
        steps[0].repo_state.as_ref().map(|r| r.repository_path.as_str()),
        Some("/workspace")
    );
    assert_eq!(steps[1].tool_use_id.as_deref(), Some("toolu_1"));
}

#[tokio::test]
async fn memory_store_contract() {
    let store = MemoryStore::new();
    runs_and_steps_keep_creation_order(&store).await;
    update_run_persists_status(&store).await;
    archive_refused_while_running(&store).await;
    missing_records_are_not_found(&store).await;
    step_documents_round_trip(&store).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    runs_and_steps_keep_creation_order(&store).await;
    update_run_persists_status(&store).await;
    archive_refused_while_running(&store).await;
    missing_records_are_not_found(&store).await;
    step_documents_round_trip(&store).await;
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runbox.db");
    let run_id;
    {
        let store = SqliteStore::open(&path).await.unwrap();
        let task = seed(&store).await;
        let run = Run::new(task.id, "persist");
        run_id = run.id;
        store.insert_run(&run).await.unwrap();
        store.insert_step(&Step::error(run.id, "boom")).await.unwrap();
    }
    let store = SqliteStore::open(&path).await.unwrap();
    let steps = store.steps_for_run(run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].kind, StepKind::Error);
}
