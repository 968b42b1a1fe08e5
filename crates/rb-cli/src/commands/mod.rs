pub mod check;
pub mod rebuild;
pub mod run;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rb_core::config::Config;
use rb_core::filter::SensitiveFilter;
use rb_core::sqlite_store::SqliteStore;
use rb_core::store::RunStore;
use rb_core::types::Step;
use rb_engine::RunSettings;
use rb_runtime::{ContainerRuntime, DockerRuntime};
use serde_json::json;

/// Open the SQLite store at `db`, or `<data_dir>/runbox.db`.
pub async fn open_store(
    config: &Config,
    db: Option<PathBuf>,
) -> anyhow::Result<Arc<dyn RunStore>> {
    let path = match db {
        Some(path) => path,
        None => {
            let dir = config.data_dir();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating data dir {}", dir.display()))?;
            dir.join("runbox.db")
        }
    };
    let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(store))
}

pub fn docker_runtime(config: &Config) -> Arc<dyn ContainerRuntime> {
    Arc::new(DockerRuntime::new(config.docker.connect_timeout_secs))
}

pub fn settings(config: &Config) -> RunSettings {
    RunSettings::from_config(config)
}

/// Print a timeline with sensitive values replaced by the marker.
pub fn print_steps(
    steps: &[Step],
    filter: &SensitiveFilter,
    as_json: bool,
) -> anyhow::Result<()> {
    if as_json {
        let rows: Vec<_> = steps
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "kind": s.kind,
                    "content": s.filtered_content(filter),
                    "tool_use_id": s.tool_use_id,
                    "has_repo_state": s.repo_state.is_some(),
                    "created_at": s.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for step in steps {
        let text = step.display_text(filter);
        match step.tool_use_id.as_deref() {
            Some(id) => println!("[{}] ({id}) {}", step.kind.label(), text.trim_end()),
            None => println!("[{}] {}", step.kind.label(), text.trim_end()),
        }
        if let Some(state) = &step.repo_state {
            println!(
                "    repo {}: {} uncommitted, {} vs target",
                state.repository_path,
                diff_size(&filter.apply(&state.uncommitted_diff)),
                diff_size(&filter.apply(&state.target_branch_diff)),
            );
        }
    }
    Ok(())
}

fn diff_size(diff: &str) -> String {
    format!("{} lines", diff.lines().count())
}
