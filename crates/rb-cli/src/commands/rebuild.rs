use std::path::PathBuf;

use rb_core::config::Config;
use rb_engine::{EventBus, ImageBuilder};
use uuid::Uuid;

use super::{docker_runtime, open_store, settings};

pub async fn run(config: &Config, task_id: Uuid, db: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(config, db).await?;
    let builder =
        ImageBuilder::new(docker_runtime(config), store, EventBus::new(), settings(config));
    let tag = builder.rebuild(task_id).await?;
    println!("task {task_id} now uses {tag}");
    Ok(())
}
