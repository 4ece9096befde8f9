//! Data model shared by the engine, the stores and the notifiers.

pub mod execution;
pub mod notification;
pub mod task;

pub use execution::{
    ExecutionLog, ExecutionOutcome, ExecutionResult, truncate_captured, truncate_output,
};
pub use notification::{MailRecipients, NotificationRequest, NotificationSettings};
pub use task::{
    AuthRequest, Command, CommandOptions, Endpoint, EndpointOptions, HttpMethod, MAX_TIMEOUT_SECS,
    RetryPolicy, ShellKind, Task, TaskAction, TaskState, TaskUpdate,
};
