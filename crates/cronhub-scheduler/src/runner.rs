//! Task runner: one execution attempt, normalised into an [`ExecutionOutcome`].
//!
//! The backend call runs in its own tokio task under a deadline. On timeout
//! the task is aborted, which drops the in-flight future: the command's
//! process group is killed and an HTTP request is cancelled. A panicking
//! backend is caught at the join handle. Nothing escapes as an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use cronhub_core::config::ExecutionConfig;
use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::{CommandBackend, RequestBackend};
use cronhub_core::types::{
    ExecutionOutcome, ExecutionResult, MAX_TIMEOUT_SECS, Task, TaskAction,
};

use crate::command::CommandExecutor;
use crate::request::RequestExecutor;

/// Backend result reduced to what an outcome needs.
struct ActionReport {
    success: bool,
    output: String,
    error: Option<String>,
    attempts: u32,
}

#[derive(Clone)]
pub struct TaskRunner {
    commands: Arc<dyn CommandBackend>,
    requests: Arc<dyn RequestBackend>,
    default_timeout: Duration,
}

impl TaskRunner {
    pub fn new(
        commands: Arc<dyn CommandBackend>,
        requests: Arc<dyn RequestBackend>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            requests,
            default_timeout,
        }
    }

    /// Runner backed by the real command and HTTP executors.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            Arc::new(CommandExecutor::new(config)),
            Arc::new(RequestExecutor::new(config)),
            Duration::from_secs(config.default_timeout_secs),
        )
    }

    /// Deadline budget for one run of `task`.
    pub fn timeout_for(&self, task: &Task) -> Duration {
        let secs = match &task.action {
            TaskAction::Command(command) => command.timeout_secs(),
            TaskAction::Request(endpoint) => endpoint.timeout_secs(),
        };
        secs.map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
            .min(Duration::from_secs(MAX_TIMEOUT_SECS))
    }

    pub async fn run(&self, task: &Task) -> ExecutionOutcome {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let timeout = self.timeout_for(task);
        let deadline = tokio::time::Instant::now() + timeout;

        let commands = self.commands.clone();
        let requests = self.requests.clone();
        let action = task.action.clone();
        let mut handle = tokio::spawn(async move {
            match action {
                TaskAction::Command(command) => {
                    commands.execute(&command).await.map(|r| ActionReport {
                        success: r.success,
                        output: r.output,
                        error: r.error,
                        attempts: 1,
                    })
                }
                TaskAction::Request(endpoint) => {
                    requests.execute(&endpoint, deadline).await.map(|r| ActionReport {
                        success: r.success,
                        output: r.response,
                        error: r.error,
                        attempts: r.attempts,
                    })
                }
            }
        });

        let result: Result<ActionReport> = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(join_error)) => Err(CronHubError::Script(format!(
                "executor crashed: {join_error}"
            ))),
            Err(_) => {
                handle.abort();
                tracing::warn!(
                    "⏰ Task '{}' ({}) timed out after {}s",
                    task.name,
                    task.id,
                    timeout.as_secs()
                );
                Err(CronHubError::ExecutionTimeout(timeout.as_secs()))
            }
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        match result {
            Ok(report) => ExecutionOutcome {
                started_at,
                result: ExecutionResult::from_success(report.success),
                output: report.output,
                error: if report.success { None } else { report.error },
                duration_ms,
                attempts: report.attempts,
            },
            Err(e) => {
                if !e.is_execution_error() {
                    tracing::warn!(
                        "⚠️ Executor for '{}' ({}) failed outside the task: {e}",
                        task.name,
                        task.id
                    );
                }
                ExecutionOutcome {
                    started_at,
                    result: ExecutionResult::Failure,
                    output: String::new(),
                    error: Some(e.to_string()),
                    duration_ms,
                    attempts: 1,
                }
            }
        }
    }
}
