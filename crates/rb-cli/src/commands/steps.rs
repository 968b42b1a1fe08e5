use std::path::PathBuf;

use rb_core::config::Config;
use rb_core::filter::SensitiveFilter;
use rb_core::timeline::pair_tool_calls;
use uuid::Uuid;

use super::{open_store, print_steps};

pub async fn run(
    config: &Config,
    run_id: Uuid,
    db: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(config, db).await?;
    let run = store.get_run(run_id).await?;
    let task = store.get_task(run.task_id).await?;
    let user = store.get_user(task.user_id).await?;
    let project = store.get_project(task.project_id).await?;

    let filter =
        SensitiveFilter::for_context(Some(&user), Some(&project), &config.runs.redaction_marker);
    let steps = store.steps_for_run(run.id).await?;
    print_steps(&steps, &filter, json)?;

    if !json {
        let pending = pair_tool_calls(&steps)
            .into_iter()
            .filter(|(_, result)| result.is_none())
            .count();
        println!(
            "run {}: {} ({} steps, {pending} tool calls without result)",
            run.id,
            run.status,
            steps.len()
        );
    }
    Ok(())
}
