//! Task validation: runs when a task is saved, before it reaches the store.
//! A malformed cron expression is the one error users see directly, so it is
//! reported here rather than on every tick.

use cronhub_core::error::{CronHubError, Result};
use cronhub_core::types::{MAX_TIMEOUT_SECS, Task, TaskAction};

use crate::cron::CronSchedule;

/// Check a task definition. Returns `InvalidExpression` for a bad schedule and
/// `Validation` for anything else.
pub fn validate(task: &Task) -> Result<()> {
    if task.name.trim().is_empty() {
        return Err(CronHubError::Validation("task name is empty".into()));
    }

    CronSchedule::parse(&task.cron_expression)?;

    match &task.action {
        TaskAction::Command(command) => {
            if command.script.trim().is_empty() {
                return Err(CronHubError::Validation("command script is empty".into()));
            }
            validate_secs("timeout", command.options.timeout_secs)?;
        }
        TaskAction::Request(endpoint) => {
            validate_url(&endpoint.url)?;
            validate_secs("timeout", endpoint.options.timeout_secs)?;
            validate_secs("retry delay", Some(endpoint.options.retry.delay_secs))?;
            if let Some(auth) = &endpoint.auth_request {
                validate_url(&auth.url)?;
                if auth.token_field.trim().is_empty() {
                    return Err(CronHubError::Validation(
                        "auth request has no token_field".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_secs(what: &str, secs: Option<u64>) -> Result<()> {
    match secs {
        Some(secs) if secs > MAX_TIMEOUT_SECS => Err(CronHubError::Validation(format!(
            "{what} of {secs}s exceeds the maximum of {MAX_TIMEOUT_SECS}s"
        ))),
        _ => Ok(()),
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CronHubError::Validation(format!("invalid url '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(CronHubError::Validation(format!(
            "unsupported url scheme '{other}' in '{url}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronhub_core::types::{AuthRequest, Command, Endpoint, HttpMethod};

    #[test]
    fn test_valid_command_task() {
        let task = Task::command("hello", "0 0 * * *", Command::bash("echo hi"));
        assert!(validate(&task).is_ok());
    }

    #[test]
    fn test_invalid_cron_is_surfaced() {
        let task = Task::command("hello", "0 0 * *", Command::bash("echo hi"));
        assert!(matches!(
            validate(&task),
            Err(CronHubError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_empty_script_rejected() {
        let task = Task::command("hello", "* * * * *", Command::bash("   "));
        assert!(matches!(validate(&task), Err(CronHubError::Validation(_))));
    }

    #[test]
    fn test_oversized_timeouts_rejected() {
        let task = Task::command("hello", "* * * * *", Command::bash("true").with_timeout(u64::MAX));
        assert!(matches!(validate(&task), Err(CronHubError::Validation(_))));

        let week = Command::bash("true").with_timeout(MAX_TIMEOUT_SECS);
        assert!(validate(&Task::command("hello", "* * * * *", week)).is_ok());

        let mut endpoint = Endpoint::new(HttpMethod::Get, "https://example.com");
        endpoint.options.retry.delay_secs = MAX_TIMEOUT_SECS + 1;
        let task = Task::request("fetch", "* * * * *", endpoint);
        assert!(matches!(validate(&task), Err(CronHubError::Validation(_))));
    }

    #[test]
    fn test_request_urls_checked() {
        let mut endpoint = Endpoint::new(HttpMethod::Get, "ftp://example.com/file");
        let task = Task::request("fetch", "* * * * *", endpoint.clone());
        assert!(validate(&task).is_err());

        endpoint.url = "https://example.com/api".into();
        endpoint.auth_request = Some(AuthRequest {
            url: "https://example.com/login".into(),
            method: HttpMethod::Post,
            headers: Default::default(),
            data: None,
            token_field: "".into(),
        });
        let task = Task::request("fetch", "* * * * *", endpoint.clone());
        assert!(validate(&task).is_err(), "missing token_field");

        if let Some(auth) = endpoint.auth_request.as_mut() {
            auth.token_field = "access_token".into();
        }
        let task = Task::request("fetch", "* * * * *", endpoint);
        assert!(validate(&task).is_ok());
    }
}
