use std::path::{Path, PathBuf};

use anyhow::Context;
use rb_core::config::Config;
use rb_core::filter::SensitiveFilter;
use rb_core::types::{Run, RunStatus};
use rb_engine::{EventBus, RunEvent, RunExecutor};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{docker_runtime, open_store, print_steps, settings};
use crate::manifest::Manifest;

/// Where the task of a new run comes from.
pub enum TaskSource {
    /// Create user, project, agent and task records from a manifest.
    Manifest(PathBuf),
    /// Start a follow-up run of a task already in the database.
    Stored(Uuid),
}

pub async fn run(
    config: &Config,
    source: TaskSource,
    prompt: &str,
    db: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(config, db).await?;

    let (user, project, task) = match source {
        TaskSource::Stored(id) => {
            let task = store.get_task(id).await.context("loading task")?;
            let user = store.get_user(task.user_id).await?;
            let project = store.get_project(task.project_id).await?;
            (user, project, task)
        }
        TaskSource::Manifest(manifest) => {
            let base = manifest.parent().unwrap_or_else(|| Path::new("."));
            let records =
                Manifest::load(&manifest)?.into_records(base, |name| std::env::var(name).ok())?;
            store.insert_user(&records.user).await?;
            store.insert_project(&records.project).await?;
            store.insert_agent(&records.agent).await?;
            store.insert_task(&records.task).await?;
            info!(task_id = %records.task.id, "task created");
            (records.user, records.project, records.task)
        }
    };

    let run = Run::new(task.id, prompt);
    store.insert_run(&run).await?;

    let bus = EventBus::new();
    let events = bus.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                RunEvent::RunStatusChanged { run_id, status, .. } => {
                    info!(run_id = %run_id, status = %status, "status changed")
                }
                RunEvent::StepAppended { step, .. } => {
                    debug!(kind = %step.kind, "step appended")
                }
                RunEvent::TaskUpdated { task_id } => debug!(task_id = %task_id, "task updated"),
            }
        }
    });

    let executor = RunExecutor::new(docker_runtime(config), store.clone(), bus, settings(config));
    let finished = executor.execute(run.id).await?;
    drop(executor);
    join_progress(progress).await;

    let filter =
        SensitiveFilter::for_context(Some(&user), Some(&project), &config.runs.redaction_marker);
    let steps = store.steps_for_run(run.id).await?;
    print_steps(&steps, &filter, json)?;

    println!("task {} run {}: {}", task.id, finished.id, finished.status);
    if finished.status != RunStatus::Completed {
        anyhow::bail!("run {} {}", finished.id, finished.status);
    }
    Ok(())
}

/// Wait for the progress reporter. A panicked or cancelled reporter is
/// logged only.
async fn join_progress(progress: JoinHandle<()>) {
    if let Err(e) = progress.await {
        warn!(error = %e, "progress reporter ended abnormally");
    }
}
