//! Task store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Task, TaskUpdate};

/// Persistence for tasks. Every mutation is a single-record atomic operation
/// so redundant scheduler instances cannot corrupt a task's history.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks the scheduler should consider: every state except INACTIVE,
    /// optionally scoped to one organization. Implementations may leave
    /// `execution_logs` empty here; `get` always returns the full history.
    async fn fetch_active_tasks(&self, organization_id: Option<&str>) -> Result<Vec<Task>>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    async fn list(&self) -> Result<Vec<Task>>;

    /// Store a new task (or replace its definition).
    async fn insert(&self, task: &Task) -> Result<()>;

    /// Claim the task for `owner` until `lease_until`. Returns `false` when a
    /// live claim is held by anyone, including `owner` itself.
    async fn try_claim(
        &self,
        task_id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the claim if `owner` still holds it.
    async fn release(&self, task_id: &str, owner: &str) -> Result<()>;

    /// Apply one mutation atomically.
    async fn update(&self, task_id: &str, update: TaskUpdate) -> Result<()>;
}
