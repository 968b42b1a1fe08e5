use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Agent, Project, Run, RunStatus, Step, Task, User};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database: {0}")]
    Database(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Persistence the engine reads and writes through.
///
/// Runs of a task and steps of a run are returned in creation order.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, id: Uuid) -> Result<User>;

    async fn insert_project(&self, project: &Project) -> Result<()>;
    async fn get_project(&self, id: Uuid) -> Result<Project>;

    async fn insert_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: Uuid) -> Result<Agent>;

    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Task>;
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Run>;
    async fn update_run(&self, run: &Run) -> Result<()>;
    async fn runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>>;

    async fn insert_step(&self, step: &Step) -> Result<()>;
    async fn steps_for_run(&self, run_id: Uuid) -> Result<Vec<Step>>;

    /// Soft-delete a task. Refused while one of its runs is still running.
    async fn archive_task(&self, id: Uuid) -> Result<Task> {
        let running = self
            .runs_for_task(id)
            .await?
            .into_iter()
            .any(|r| r.status == RunStatus::Running);
        if running {
            return Err(StoreError::Conflict(format!(
                "task {id} has a running run and cannot be archived"
            )));
        }
        let mut task = self.get_task(id).await?;
        if task.archived_at.is_none() {
            task.archived_at = Some(Utc::now());
            self.update_task(&task).await?;
        }
        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    projects: HashMap<Uuid, Project>,
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    runs: HashMap<Uuid, Run>,
    run_order: Vec<Uuid>,
    steps: HashMap<Uuid, Vec<Step>>,
}

/// In-process store used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(entity: &'static str, id: Uuid) -> StoreError {
    StoreError::NotFound { entity, id }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        self.inner.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<User> {
        self.inner
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("user", id))
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        self.inner
            .write()
            .await
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("project", id))
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.inner
            .write()
            .await
            .agents
            .insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        self.inner
            .read()
            .await
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("agent", id))
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.inner.write().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("task", id))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(missing("task", task.id)),
        }
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.insert(run.id, run.clone()).is_none() {
            inner.run_order.push(run.id);
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.inner
            .read()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("run", id))
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(missing("run", run.id)),
        }
    }

    async fn runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn insert_step(&self, step: &Step) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(&step.run_id) {
            return Err(missing("run", step.run_id));
        }
        inner
            .steps
            .entry(step.run_id)
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn steps_for_run(&self, run_id: Uuid) -> Result<Vec<Step>> {
        Ok(self
            .inner
            .read()
            .await
            .steps
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
