//! Notification dispatch: decides whether an execution deserves a message,
//! renders it, and hands it to a background worker.
//!
//! Delivery is best-effort: the outcome is already recorded by the time a
//! message is queued, and a failed or slow notifier only produces a warning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cronhub_core::traits::Notifier;
use cronhub_core::types::{ExecutionLog, NotificationRequest, Task, truncate_output};

/// Output cap when a task does not set `max_output_size`.
const DEFAULT_MAX_OUTPUT: usize = 4096;

#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<NotificationRequest>,
}

impl NotificationDispatcher {
    /// Start the delivery worker. It exits once every dispatcher clone is
    /// dropped and the queue is drained.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        queue: usize,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let worker = tokio::spawn(deliver(rx, notifier, timeout));
        (Self { tx }, worker)
    }

    /// Queue a notification for `log` if the task's settings ask for one.
    /// Returns whether a message was queued.
    pub fn dispatch(&self, task: &Task, log: &ExecutionLog) -> bool {
        let Some(request) = build_request(task, log) else {
            return false;
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    "📭 Notification queue full, dropping message for '{}'",
                    dropped.task_name
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                tracing::warn!(
                    "📭 Notification worker stopped, dropping message for '{}'",
                    dropped.task_name
                );
                false
            }
        }
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<NotificationRequest>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
) {
    while let Some(request) = rx.recv().await {
        match tokio::time::timeout(timeout, notifier.send(&request)).await {
            Ok(Ok(())) => tracing::info!(
                "📧 Notification sent via {} for '{}' ({})",
                notifier.name(),
                request.task_name,
                request.log.result
            ),
            Ok(Err(e)) => tracing::warn!(
                "⚠️ Notification via {} failed for '{}': {e}",
                notifier.name(),
                request.task_name
            ),
            Err(_) => tracing::warn!(
                "⚠️ Notification via {} timed out after {}s for '{}'",
                notifier.name(),
                timeout.as_secs(),
                request.task_name
            ),
        }
    }
    tracing::debug!("Notification worker stopped");
}

/// Build the message for `log`, or `None` when the task's settings do not
/// want one or there is no primary recipient.
pub fn build_request(task: &Task, log: &ExecutionLog) -> Option<NotificationRequest> {
    let settings = task.notification_settings.as_ref()?;
    let recipients = task.mail_recipients.as_ref()?;
    if !settings.wants(log.result) || !recipients.has_primary() {
        return None;
    }

    let cap = settings.max_output_size.unwrap_or(DEFAULT_MAX_OUTPUT);
    let (output, error) = if settings.include_output {
        (
            truncate_output(&log.output, cap),
            log.error.as_deref().map(|e| truncate_output(e, cap)).unwrap_or_default(),
        )
    } else {
        (String::new(), String::new())
    };

    let body = match settings.custom_template.as_deref() {
        Some(template) if !template.trim().is_empty() => {
            render_template(template, task, log, &output, &error)
        }
        _ => render_default(task, log, settings.include_output, &output, &error),
    };

    Some(NotificationRequest {
        task_id: task.id.clone(),
        task_name: task.name.clone(),
        log: log.clone(),
        recipients: recipients.clone(),
        settings: settings.clone(),
        subject: format!("[cronhub] {}: {}", task.name, log.result),
        body,
    })
}

fn render_default(
    task: &Task,
    log: &ExecutionLog,
    include_output: bool,
    output: &str,
    error: &str,
) -> String {
    let mut body = format!(
        "Task: {}\nResult: {}\nExecuted at: {}\nDuration: {} ms\n",
        task.name,
        log.result,
        log.executed_at.to_rfc3339(),
        log.duration_ms
    );
    if include_output {
        if !output.is_empty() {
            body.push_str("\nOutput:\n");
            body.push_str(output);
            if !output.ends_with('\n') {
                body.push('\n');
            }
        }
        if !error.is_empty() {
            body.push_str("\nError:\n");
            body.push_str(error);
            body.push('\n');
        }
    }
    body
}

fn render_template(
    template: &str,
    task: &Task,
    log: &ExecutionLog,
    output: &str,
    error: &str,
) -> String {
    template
        .replace("{{task_name}}", &task.name)
        .replace("{{result}}", log.result.as_str())
        .replace("{{executed_at}}", &log.executed_at.to_rfc3339())
        .replace("{{duration_ms}}", &log.duration_ms.to_string())
        .replace("{{output}}", output)
        .replace("{{error}}", error)
}
