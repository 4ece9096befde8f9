//! Task definitions: the schedulable unit and its two payload kinds.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ExecutionLog, ExecutionResult};
use super::notification::{MailRecipients, NotificationSettings};
use crate::error::CronHubError;

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Opaque unique id, stable across edits.
    #[serde(default = "new_task_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 5-field cron expression (MIN HOUR DOM MON DOW).
    pub cron_expression: String,
    /// What to run when the task fires.
    pub action: TaskAction,
    #[serde(default)]
    pub state: TaskState,
    /// Run once right after the task is stored.
    #[serde(default)]
    pub launch_on_save: bool,
    #[serde(default)]
    pub last_execution_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_result: Option<ExecutionResult>,
    /// Append-only, chronological.
    #[serde(default)]
    pub execution_logs: Vec<ExecutionLog>,
    #[serde(default)]
    pub notification_settings: Option<NotificationSettings>,
    #[serde(default)]
    pub mail_recipients: Option<MailRecipients>,
    /// Tenant scope. Opaque to the engine apart from poll filtering.
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What the task does when triggered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Run a shell script.
    Command(Command),
    /// Issue an HTTP request.
    Request(Endpoint),
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Active,
    /// Disabled by the user; never polled, never touched by the recorder.
    Inactive,
    /// Last execution failed.
    Error,
}

impl TaskState {
    /// State after an execution with the given result.
    pub fn after_execution(self, result: ExecutionResult) -> Self {
        match (self, result) {
            (Self::Inactive, _) => Self::Inactive,
            (_, ExecutionResult::Success) => Self::Active,
            (_, ExecutionResult::Failure) => Self::Error,
        }
    }

    /// Whether the scheduler should consider this task at all.
    pub fn is_schedulable(self) -> bool {
        self != Self::Inactive
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CronHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            "ERROR" => Ok(Self::Error),
            other => Err(CronHubError::Validation(format!("unknown task state '{other}'"))),
        }
    }
}

/// A single mutation applied atomically by a [`crate::traits::TaskStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Append a log, refresh the denormalised fields, apply the state machine.
    RecordExecution(ExecutionLog),
    /// Explicit user toggle.
    SetState(TaskState),
}

// ─── Command ────────────────────────────────────────────────

/// Shell script payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub script: String,
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(default)]
    pub options: CommandOptions,
}

/// Script dialect.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    #[default]
    Bash,
    Pwsh,
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Pwsh => write!(f, "pwsh"),
        }
    }
}

/// Longest accepted execution timeout or retry delay (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOptions {
    #[serde(default)]
    pub timeout_enabled: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub elevated_privileges: bool,
    /// When false the log keeps an empty output.
    #[serde(default = "default_true")]
    pub save_output: bool,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout_enabled: false,
            timeout_secs: None,
            elevated_privileges: false,
            save_output: true,
            working_directory: None,
            environment_variables: BTreeMap::new(),
        }
    }
}

impl Command {
    /// A bash script with default options.
    pub fn bash(script: &str) -> Self {
        Self {
            script: script.to_string(),
            shell: ShellKind::Bash,
            options: CommandOptions::default(),
        }
    }

    /// Enable the per-command timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.options.timeout_enabled = true;
        self.options.timeout_secs = Some(secs);
        self
    }

    /// Configured timeout, if enabled and non-zero.
    pub fn timeout_secs(&self) -> Option<u64> {
        if !self.options.timeout_enabled {
            return None;
        }
        self.options.timeout_secs.filter(|s| *s > 0)
    }
}

// ─── Endpoint ───────────────────────────────────────────────

/// HTTP request payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body, serialised according to the Content-Type header.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Secondary request that yields a bearer token.
    #[serde(default)]
    pub auth_request: Option<AuthRequest>,
    #[serde(default)]
    pub options: EndpointOptions,
}

impl Endpoint {
    pub fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            url: url.to_string(),
            method,
            headers: BTreeMap::new(),
            data: None,
            auth_request: None,
            options: EndpointOptions::default(),
        }
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.options.timeout_secs.filter(|s| *s > 0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-request authentication call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequest {
    pub url: String,
    #[serde(default = "default_auth_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Dotted path to the token in the JSON response, e.g. `data.access_token`.
    pub token_field: String,
}

fn default_auth_method() -> HttpMethod {
    HttpMethod::Post
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointOptions {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_true")]
    pub validate_ssl: bool,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            retry: RetryPolicy::default(),
            validate_ssl: true,
            follow_redirects: true,
        }
    }
}

/// Retry policy for HTTP tasks. Only transport errors and 5xx are retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay_secs() -> u64 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

// ─── Task ───────────────────────────────────────────────────

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Task {
    fn with_action(name: &str, cron_expression: &str, action: TaskAction) -> Self {
        Self {
            id: new_task_id(),
            name: name.to_string(),
            description: None,
            cron_expression: cron_expression.to_string(),
            action,
            state: TaskState::Active,
            launch_on_save: false,
            last_execution_date: None,
            last_execution_result: None,
            execution_logs: Vec::new(),
            notification_settings: None,
            mail_recipients: None,
            organization_id: None,
            created_by: None,
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }

    /// Create a command task.
    pub fn command(name: &str, cron_expression: &str, command: Command) -> Self {
        Self::with_action(name, cron_expression, TaskAction::Command(command))
    }

    /// Create an HTTP request task.
    pub fn request(name: &str, cron_expression: &str, endpoint: Endpoint) -> Self {
        Self::with_action(name, cron_expression, TaskAction::Request(endpoint))
    }

    pub fn is_command(&self) -> bool {
        matches!(self.action, TaskAction::Command(_))
    }

    pub fn is_request(&self) -> bool {
        matches!(self.action, TaskAction::Request(_))
    }

    /// Lower bound of the due window: the last execution, or creation for a
    /// task that never ran.
    pub fn schedule_anchor(&self) -> DateTime<Utc> {
        self.last_execution_date.unwrap_or(self.created_at)
    }

    /// Apply a store mutation in place.
    pub fn apply(&mut self, update: &TaskUpdate) {
        match update {
            TaskUpdate::RecordExecution(log) => {
                self.last_execution_date = Some(log.executed_at);
                self.last_execution_result = Some(log.result);
                self.state = self.state.after_execution(log.result);
                self.execution_logs.push(log.clone());
            }
            TaskUpdate::SetState(state) => self.state = *state,
        }
    }
}
