//! SQLite-backed task store.
//! Survives restarts and can be shared by several scheduler processes: the
//! claim is a conditional `UPDATE` carrying a lease, and recording an
//! execution is one transaction over the log table and the task row.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::TaskStore;
use cronhub_core::types::{ExecutionLog, ExecutionResult, Task, TaskState, TaskUpdate};

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> CronHubError {
    CronHubError::Store(e.to_string())
}

/// Fixed-width UTC timestamps so lease comparisons work on the text column.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CronHubError::Store(format!("bad timestamp '{s}': {e}")))
}

fn parse_result(s: &str) -> Result<ExecutionResult> {
    match s {
        "SUCCESS" => Ok(ExecutionResult::Success),
        "FAILURE" => Ok(ExecutionResult::Failure),
        other => Err(CronHubError::Store(format!("unknown execution result '{other}'"))),
    }
}

/// Raw `tasks` row.
struct TaskRow {
    definition: String,
    state: String,
    last_execution_date: Option<String>,
    last_execution_result: Option<String>,
}

const TASK_COLUMNS: &str =
    "definition, state, last_execution_date, last_execution_result";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        definition: row.get(0)?,
        state: row.get(1)?,
        last_execution_date: row.get(2)?,
        last_execution_result: row.get(3)?,
    })
}

impl TaskRow {
    /// The JSON definition holds the static fields; the columns are
    /// authoritative for everything the engine mutates.
    fn into_task(self) -> Result<Task> {
        let mut task: Task = serde_json::from_str(&self.definition)?;
        task.state = self.state.parse()?;
        task.last_execution_date = self.last_execution_date.as_deref().map(parse_ts).transpose()?;
        task.last_execution_result = self
            .last_execution_result
            .as_deref()
            .map(parse_result)
            .transpose()?;
        task.execution_logs.clear();
        Ok(task)
    }
}

impl SqliteTaskStore {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CronHubError::Store("connection lock poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                organization_id TEXT,
                state TEXT NOT NULL DEFAULT 'ACTIVE',   -- ACTIVE, INACTIVE, ERROR
                definition TEXT NOT NULL,               -- JSON task without history
                last_execution_date TEXT,
                last_execution_result TEXT,             -- SUCCESS, FAILURE
                claimed_by TEXT,                        -- scheduler instance id
                claim_expires_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                result TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT '',
                error TEXT,
                duration_ms INTEGER NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_execution_logs_task ON execution_logs(task_id, id);
            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, organization_id);
         ",
            )
            .map_err(|e| CronHubError::Store(format!("Migration: {e}")))
    }

    fn load_logs(conn: &Connection, task_id: &str) -> Result<Vec<ExecutionLog>> {
        let mut stmt = conn
            .prepare(
                "SELECT executed_at, result, output, error, duration_ms
                 FROM execution_logs WHERE task_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut logs = Vec::new();
        for row in rows {
            let (executed_at, result, output, error, duration_ms) = row.map_err(db_err)?;
            logs.push(ExecutionLog {
                executed_at: parse_ts(&executed_at)?,
                result: parse_result(&result)?,
                output,
                error,
                duration_ms: duration_ms.max(0) as u64,
            });
        }
        Ok(logs)
    }

    fn insert_log(conn: &Connection, task_id: &str, log: &ExecutionLog) -> Result<()> {
        conn.execute(
            "INSERT INTO execution_logs (task_id, executed_at, result, output, error, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                ts(log.executed_at),
                log.result.as_str(),
                log.output,
                log.error,
                log.duration_ms as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn query_tasks(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map(params, read_row).map_err(db_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(db_err)?.into_task()?);
        }
        Ok(tasks)
    }

    fn exists(conn: &Connection, task_id: &str) -> Result<bool> {
        conn.query_row("SELECT 1 FROM tasks WHERE id = ?1", [task_id], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
            .map_err(db_err)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn fetch_active_tasks(&self, organization_id: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE state != 'INACTIVE' AND (?1 IS NULL OR organization_id = ?1)
             ORDER BY created_at, id"
        );
        Self::query_tasks(&conn, &sql, params![organization_id])
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [task_id],
                read_row,
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let mut task = row.into_task()?;
                task.execution_logs = Self::load_logs(&conn, task_id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut tasks = Self::query_tasks(
            &conn,
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, id"),
            params![],
        )?;
        for task in &mut tasks {
            task.execution_logs = Self::load_logs(&conn, &task.id)?;
        }
        Ok(tasks)
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let mut definition = task.clone();
        definition.execution_logs.clear();
        let definition = serde_json::to_string(&definition)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let is_new = !Self::exists(&tx, &task.id)?;

        // history and claims survive a definition replace
        tx.execute(
            "INSERT INTO tasks
             (id, name, organization_id, state, definition,
              last_execution_date, last_execution_result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                organization_id = excluded.organization_id,
                state = excluded.state,
                definition = excluded.definition",
            params![
                task.id,
                task.name,
                task.organization_id,
                task.state.as_str(),
                definition,
                task.last_execution_date.map(ts),
                task.last_execution_result.map(|r| r.as_str()),
                ts(task.created_at),
            ],
        )
        .map_err(db_err)?;

        if is_new {
            for log in &task.execution_logs {
                Self::insert_log(&tx, &task.id, log)?;
            }
        }
        tx.commit().map_err(db_err)?;
        tracing::debug!("💾 Saved task '{}' ({})", task.name, task.id);
        Ok(())
    }

    async fn try_claim(
        &self,
        task_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET claimed_by = ?2, claim_expires_at = ?3
                 WHERE id = ?1
                   AND (claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at <= ?4)",
                params![task_id, owner, ts(lease_until), ts(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(true);
        }
        if !Self::exists(&conn, task_id)? {
            return Err(CronHubError::NotFound(task_id.to_string()));
        }
        Ok(false)
    }

    async fn release(&self, task_id: &str, owner: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tasks SET claimed_by = NULL, claim_expires_at = NULL
                 WHERE id = ?1 AND claimed_by = ?2",
                params![task_id, owner],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn update(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let state: Option<String> = tx
            .query_row("SELECT state FROM tasks WHERE id = ?1", [task_id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        let state: TaskState = state
            .ok_or_else(|| CronHubError::NotFound(task_id.to_string()))?
            .parse()?;

        match &update {
            TaskUpdate::RecordExecution(log) => {
                Self::insert_log(&tx, task_id, log)?;
                tx.execute(
                    "UPDATE tasks SET state = ?2, last_execution_date = ?3, last_execution_result = ?4
                     WHERE id = ?1",
                    params![
                        task_id,
                        state.after_execution(log.result).as_str(),
                        ts(log.executed_at),
                        log.result.as_str(),
                    ],
                )
                .map_err(db_err)?;
            }
            TaskUpdate::SetState(new_state) => {
                tx.execute(
                    "UPDATE tasks SET state = ?2 WHERE id = ?1",
                    params![task_id, new_state.as_str()],
                )
                .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)
    }
}
