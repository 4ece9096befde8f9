//! Error taxonomy shared by the engine, the stores and the CLI.

use thiserror::Error;

/// Result alias used across cronhub crates.
pub type Result<T> = std::result::Result<T, CronHubError>;

#[derive(Debug, Error)]
pub enum CronHubError {
    /// Malformed or never-firing cron expression. Surfaced at task-save time.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Another execution of the same task holds the claim.
    #[error("task {0} is already claimed")]
    ClaimConflict(String),

    #[error("auth resolution failed: {0}")]
    AuthResolutionFailed(String),

    #[error("elevated privileges unavailable: {0}")]
    PrivilegeUnavailable(String),

    #[error("execution timed out after {0}s")]
    ExecutionTimeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid task: {0}")]
    Validation(String),

    #[error("notification error: {0}")]
    Notify(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CronHubError {
    pub fn invalid_expression(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that belong in an ExecutionLog instead of escaping the runner.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            Self::AuthResolutionFailed(_)
                | Self::PrivilegeUnavailable(_)
                | Self::ExecutionTimeout(_)
                | Self::Transport(_)
                | Self::Script(_)
        )
    }

    /// Errors the scheduler loop logs and retries on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::ClaimConflict(_))
    }
}
