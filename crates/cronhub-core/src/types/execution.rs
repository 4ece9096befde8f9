//! Execution outcomes and the immutable log entries recorded from them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    Success,
    Failure,
}

impl ExecutionResult {
    pub fn from_success(success: bool) -> Self {
        if success { Self::Success } else { Self::Failure }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded execution attempt. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub executed_at: DateTime<Utc>,
    pub result: ExecutionResult,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Normalised result of one run, as produced by the task runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub started_at: DateTime<Utc>,
    pub result: ExecutionResult,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// HTTP attempts made (1 for commands).
    pub attempts: u32,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.result == ExecutionResult::Success
    }

    pub fn to_log(&self) -> ExecutionLog {
        ExecutionLog {
            executed_at: self.started_at,
            result: self.result,
            output: self.output.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Cap `text` at `max_bytes`, cutting on a char boundary and noting the
/// original size.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    truncate_captured(text, text.len(), max_bytes)
}

/// [`truncate_output`] for text that was already capped while it was read.
/// `total_bytes` is how much the producer wrote in all.
pub fn truncate_captured(text: &str, total_bytes: usize, max_bytes: usize) -> String {
    if total_bytes <= max_bytes && text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...\n[truncated, {} bytes total]",
        &text[..cut],
        total_bytes.max(text.len())
    )
}
