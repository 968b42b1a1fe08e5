use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::store::{Result, RunStore, StoreError};
use crate::types::{Agent, Project, Run, Step, Task, User};

/// SQLite-backed [`RunStore`].
///
/// Records are stored as JSON documents; runs and steps carry an
/// autoincrement `seq` column that fixes their creation order.
pub struct SqliteStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – enum / document <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: Serialize>(val: &T) -> Result<String> {
    let s = serde_json::to_string(val)?;
    Ok(s.trim_matches('"').to_string())
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS users (
                        id   TEXT PRIMARY KEY,
                        doc  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS projects (
                        id   TEXT PRIMARY KEY,
                        doc  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agents (
                        id   TEXT PRIMARY KEY,
                        doc  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id   TEXT PRIMARY KEY,
                        doc  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS runs (
                        seq      INTEGER PRIMARY KEY AUTOINCREMENT,
                        id       TEXT NOT NULL UNIQUE,
                        task_id  TEXT NOT NULL,
                        status   TEXT NOT NULL,
                        doc      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);

                    CREATE TABLE IF NOT EXISTS steps (
                        seq      INTEGER PRIMARY KEY AUTOINCREMENT,
                        id       TEXT NOT NULL UNIQUE,
                        run_id   TEXT NOT NULL REFERENCES runs(id),
                        kind     TEXT NOT NULL,
                        doc      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generic document access
    // -----------------------------------------------------------------------

    async fn put_doc<T: Serialize>(&self, table: &'static str, id: Uuid, value: &T) -> Result<()> {
        let id = id.to_string();
        let doc = serde_json::to_string(value)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (id, doc) VALUES (?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET doc=excluded.doc"
                    ),
                    rusqlite::params![id, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        table: &'static str,
        entity: &'static str,
        id: Uuid,
    ) -> Result<T> {
        let id_str = id.to_string();
        let doc: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT doc FROM {table} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match doc {
            Some(doc) => from_doc(&doc),
            None => Err(StoreError::NotFound { entity, id }),
        }
    }

    async fn replace_doc<T: Serialize>(
        &self,
        table: &'static str,
        entity: &'static str,
        id: Uuid,
        value: &T,
        status: Option<String>,
    ) -> Result<()> {
        let id_str = id.to_string();
        let doc = serde_json::to_string(value)?;
        let changed = self
            .conn
            .call(move |conn| {
                let changed = match status {
                    Some(status) => conn.execute(
                        &format!("UPDATE {table} SET doc = ?2, status = ?3 WHERE id = ?1"),
                        rusqlite::params![id_str, doc, status],
                    )?,
                    None => conn.execute(
                        &format!("UPDATE {table} SET doc = ?2 WHERE id = ?1"),
                        rusqlite::params![id_str, doc],
                    )?,
                };
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity, id });
        }
        Ok(())
    }

    async fn ordered_docs<T: DeserializeOwned>(
        &self,
        table: &'static str,
        column: &'static str,
        key: Uuid,
    ) -> Result<Vec<T>> {
        let key = key.to_string();
        let docs: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT doc FROM {table} WHERE {column} = ?1 ORDER BY seq ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await?;
        docs.iter().map(|d| from_doc(d)).collect()
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        self.put_doc("users", user.id, user).await
    }

    async fn get_user(&self, id: Uuid) -> Result<User> {
        self.get_doc("users", "user", id).await
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        self.put_doc("projects", project.id, project).await
    }

    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.get_doc("projects", "project", id).await
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.put_doc("agents", agent.id, agent).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        self.get_doc("agents", "agent", id).await
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.put_doc("tasks", task.id, task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.get_doc("tasks", "task", id).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.replace_doc("tasks", "task", task.id, task, None).await
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        let id = run.id.to_string();
        let task_id = run.task_id.to_string();
        let status = enum_to_sql(&run.status)?;
        let doc = serde_json::to_string(run)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, task_id, status, doc) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET status=excluded.status, doc=excluded.doc",
                    rusqlite::params![id, task_id, status, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.get_doc("runs", "run", id).await
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let status = enum_to_sql(&run.status)?;
        self.replace_doc("runs", "run", run.id, run, Some(status))
            .await
    }

    async fn runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>> {
        self.ordered_docs("runs", "task_id", task_id).await
    }

    async fn insert_step(&self, step: &Step) -> Result<()> {
        let id = step.id.to_string();
        let run_id = step.run_id.to_string();
        let kind = enum_to_sql(&step.kind)?;
        let doc = serde_json::to_string(step)?;
        let run_exists = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
                    rusqlite::params![run_id],
                    |row| row.get(0),
                )?;
                if exists {
                    conn.execute(
                        "INSERT INTO steps (id, run_id, kind, doc) VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![id, run_id, kind, doc],
                    )?;
                }
                Ok(exists)
            })
            .await?;
        if !run_exists {
            return Err(StoreError::NotFound {
                entity: "run",
                id: step.run_id,
            });
        }
        Ok(())
    }

    async fn steps_for_run(&self, run_id: Uuid) -> Result<Vec<Step>> {
        self.ordered_docs("steps", "run_id", run_id).await
    }
}
