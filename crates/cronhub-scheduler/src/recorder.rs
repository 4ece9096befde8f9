//! Execution recorder: turns an outcome into one atomic store update.

use std::sync::Arc;

use cronhub_core::error::Result;
use cronhub_core::traits::TaskStore;
use cronhub_core::types::{ExecutionOutcome, Task, TaskUpdate};

pub struct ExecutionRecorder {
    store: Arc<dyn TaskStore>,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Append the log, refresh `last_execution_*` and apply the state machine
    /// in a single `update` call. Returns the task as it looks afterwards.
    pub async fn record(&self, task: &Task, outcome: &ExecutionOutcome) -> Result<Task> {
        let update = TaskUpdate::RecordExecution(outcome.to_log());
        self.store.update(&task.id, update.clone()).await?;

        // The stored state may have been toggled while the task ran; prefer it.
        let updated = match self.store.get(&task.id).await? {
            Some(stored) => stored,
            None => {
                let mut local = task.clone();
                local.apply(&update);
                local
            }
        };

        tracing::debug!(
            "📝 Recorded {} for '{}' ({}) → {}",
            outcome.result,
            task.name,
            task.id,
            updated.state
        );
        Ok(updated)
    }
}
