//! In-process task store, optionally snapshotted to `tasks.json`.
//! Human-readable and good enough for a single scheduler instance; claims
//! live in memory only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::TaskStore;
use cronhub_core::types::{Task, TaskUpdate};

struct Claim {
    owner: String,
    until: DateTime<Utc>,
}

struct Entry {
    task: Task,
    claim: Option<Claim>,
}

impl Entry {
    fn claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.until > now)
    }
}

pub struct MemoryTaskStore {
    entries: Mutex<HashMap<String, Entry>>,
    snapshot: Option<PathBuf>,
}

impl MemoryTaskStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot: None,
        }
    }

    /// Store persisted to `<dir>/tasks.json`, loading what is already there.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join("tasks.json");
        let tasks: Vec<Task> = if file.exists() {
            let json = std::fs::read_to_string(&file)?;
            serde_json::from_str(&json).map_err(|e| {
                CronHubError::Store(format!("failed to parse {}: {e}", file.display()))
            })?
        } else {
            Vec::new()
        };

        tracing::debug!("📂 Loaded {} tasks from {}", tasks.len(), file.display());
        let entries = tasks
            .into_iter()
            .map(|task| (task.id.clone(), Entry { task, claim: None }))
            .collect();
        Ok(Self {
            entries: Mutex::new(entries),
            snapshot: Some(file),
        })
    }

    /// Write the snapshot as it would look with `pending` stored. Callers
    /// commit `pending` to memory only once this succeeds.
    fn save(&self, entries: &HashMap<String, Entry>, pending: &Task) -> Result<()> {
        let Some(file) = &self.snapshot else {
            return Ok(());
        };
        let mut tasks: Vec<&Task> = entries
            .values()
            .map(|e| &e.task)
            .filter(|t| t.id != pending.id)
            .collect();
        tasks.push(pending);
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let json = serde_json::to_string_pretty(&tasks)?;
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, file)?;
        tracing::debug!("💾 Saved {} tasks to {}", tasks.len(), file.display());
        Ok(())
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    tasks
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn fetch_active_tasks(&self, organization_id: Option<&str>) -> Result<Vec<Task>> {
        let entries = self.entries.lock().await;
        let tasks = entries
            .values()
            .map(|e| &e.task)
            .filter(|t| t.state.is_schedulable())
            .filter(|t| organization_id.is_none() || t.organization_id.as_deref() == organization_id)
            .cloned()
            .collect();
        Ok(sorted(tasks))
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.entries.lock().await.get(task_id).map(|e| e.task.clone()))
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let entries = self.entries.lock().await;
        Ok(sorted(entries.values().map(|e| e.task.clone()).collect()))
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let mut entries = self.entries.lock().await;
        self.save(&entries, task)?;
        let claim = entries.remove(&task.id).and_then(|e| e.claim);
        entries.insert(
            task.id.clone(),
            Entry {
                task: task.clone(),
                claim,
            },
        );
        Ok(())
    }

    async fn try_claim(
        &self,
        task_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(task_id)
            .ok_or_else(|| CronHubError::NotFound(task_id.to_string()))?;
        if entry.claimed(Utc::now()) {
            return Ok(false);
        }
        entry.claim = Some(Claim {
            owner: owner.to_string(),
            until: lease_until,
        });
        Ok(true)
    }

    async fn release(&self, task_id: &str, owner: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(task_id) {
            if entry.claim.as_ref().is_some_and(|c| c.owner == owner) {
                entry.claim = None;
            }
        }
        Ok(())
    }

    async fn update(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut updated = entries
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| CronHubError::NotFound(task_id.to_string()))?;
        updated.apply(&update);
        self.save(&entries, &updated)?;
        if let Some(entry) = entries.get_mut(task_id) {
            entry.task = updated;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cronhub_core::types::{Command, ExecutionLog, ExecutionResult, TaskState};
    use std::sync::Arc;

    fn task(name: &str) -> Task {
        Task::command(name, "* * * * *", Command::bash("true"))
    }

    #[tokio::test]
    async fn test_fetch_skips_inactive_and_scopes_org() {
        let store = MemoryTaskStore::new();
        let mut a = task("a");
        a.organization_id = Some("org-1".into());
        let mut b = task("b");
        b.state = TaskState::Inactive;
        let mut c = task("c");
        c.state = TaskState::Error;
        c.organization_id = Some("org-2".into());
        for t in [&a, &b, &c] {
            store.insert(t).await.unwrap();
        }

        let all = store.fetch_active_tasks(None).await.unwrap();
        let names: Vec<_> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a") && names.contains(&"c"));

        let scoped = store.fetch_active_tasks(Some("org-1")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "a");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        let lease = Utc::now() + Duration::seconds(60);

        assert!(store.try_claim(&t.id, "one", lease).await.unwrap());
        assert!(!store.try_claim(&t.id, "two", lease).await.unwrap());
        assert!(!store.try_claim(&t.id, "one", lease).await.unwrap());

        // only the owner can release
        store.release(&t.id, "two").await.unwrap();
        assert!(!store.try_claim(&t.id, "two", lease).await.unwrap());

        store.release(&t.id, "one").await.unwrap();
        assert!(store.try_claim(&t.id, "two", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        let expired = Utc::now() - Duration::seconds(1);
        assert!(store.try_claim(&t.id, "crashed", expired).await.unwrap());
        assert!(
            store
                .try_claim(&t.id, "alive", Utc::now() + Duration::seconds(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_one_winner() {
        let store = Arc::new(MemoryTaskStore::new());
        let t = task("a");
        store.insert(&t).await.unwrap();
        let lease = Utc::now() + Duration::seconds(60);

        let attempts = (0..16).map(|i| {
            let store = store.clone();
            let id = t.id.clone();
            async move { store.try_claim(&id, &format!("worker-{i}"), lease).await.unwrap() }
        });
        let results = futures::future::join_all(attempts).await;
        assert_eq!(results.iter().filter(|won| **won).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let store = MemoryTaskStore::new();
        assert!(matches!(
            store.try_claim("nope", "me", Utc::now()).await,
            Err(CronHubError::NotFound(_))
        ));
        assert!(store.update("nope", TaskUpdate::SetState(TaskState::Inactive)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_task_untouched() {
        let dir = std::env::temp_dir().join("cronhub-memory-store-readonly");
        std::fs::remove_dir_all(&dir).ok();
        let store = MemoryTaskStore::open(&dir).unwrap();
        let t = task("stuck");
        store.insert(&t).await.unwrap();

        // the temp file cannot be written over a directory
        std::fs::create_dir_all(dir.join("tasks.json.tmp")).unwrap();
        let log = ExecutionLog {
            executed_at: Utc::now(),
            result: ExecutionResult::Success,
            output: "ok".into(),
            error: None,
            duration_ms: 1,
        };
        assert!(store.update(&t.id, TaskUpdate::RecordExecution(log)).await.is_err());

        let stored = store.get(&t.id).await.unwrap().unwrap();
        assert!(stored.execution_logs.is_empty());
        assert_eq!(stored.last_execution_date, None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = std::env::temp_dir().join("cronhub-memory-store-test");
        std::fs::remove_dir_all(&dir).ok();
        let t = task("persisted");
        {
            let store = MemoryTaskStore::open(&dir).unwrap();
            store.insert(&t).await.unwrap();
            store
                .update(
                    &t.id,
                    TaskUpdate::RecordExecution(ExecutionLog {
                        executed_at: Utc::now(),
                        result: ExecutionResult::Failure,
                        output: String::new(),
                        error: Some("boom".into()),
                        duration_ms: 3,
                    }),
                )
                .await
                .unwrap();
        }

        let reopened = MemoryTaskStore::open(&dir).unwrap();
        let loaded = reopened.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "persisted");
        assert_eq!(loaded.state, TaskState::Error);
        assert_eq!(loaded.execution_logs.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = std::env::temp_dir().join("cronhub-memory-store-corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tasks.json"), "{not json").unwrap();
        assert!(matches!(
            MemoryTaskStore::open(&dir),
            Err(CronHubError::Store(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
