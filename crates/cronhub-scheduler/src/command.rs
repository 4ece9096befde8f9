//! Command executor: runs a task's bash or PowerShell script.
//!
//! The child leads its own process group. When the runner drops the future
//! on timeout or shutdown, the whole group is signalled, so subshells and
//! pipelines stop along with the interpreter. stdout and stderr are read
//! through a cap and the excess is discarded as it arrives.
//!
//! Failure policy: the exit status is authoritative. stderr of a successful
//! run is kept in the output under a `[stderr]` marker; stderr of a failed run
//! becomes the error text.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as Process};

use cronhub_core::config::ExecutionConfig;
use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::{CommandBackend, CommandReport};
use cronhub_core::types::{Command, ShellKind, truncate_captured};

/// Time a cancelled group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct CommandExecutor {
    bash_path: String,
    pwsh_path: String,
    sudo_path: String,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            bash_path: config.bash_path.clone(),
            pwsh_path: config.pwsh_path.clone(),
            sudo_path: config.sudo_path.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Interpreter and arguments for a script.
    fn interpreter(&self, shell: ShellKind, script: &str) -> (String, Vec<String>) {
        match shell {
            ShellKind::Bash => (
                self.bash_path.clone(),
                vec!["-c".to_string(), script.to_string()],
            ),
            ShellKind::Pwsh => (
                self.pwsh_path.clone(),
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    script.to_string(),
                ],
            ),
        }
    }

    /// Wrap the invocation so it runs elevated, or fail fast.
    async fn elevate(&self, program: String, args: Vec<String>) -> Result<(String, Vec<String>)> {
        if is_privileged() {
            return Ok((program, args));
        }

        if !cfg!(unix) {
            return Err(CronHubError::PrivilegeUnavailable(
                "elevation is not supported on this platform".into(),
            ));
        }

        // sudo -n never prompts; it fails when a password would be needed
        let sudo_check = Process::new(&self.sudo_path)
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match sudo_check {
            Ok(status) if status.success() => {
                let mut wrapped = vec!["-n".to_string(), "--".to_string(), program];
                wrapped.extend(args);
                Ok((self.sudo_path.clone(), wrapped))
            }
            Ok(_) => Err(CronHubError::PrivilegeUnavailable(
                "not running as root and passwordless sudo is not permitted".into(),
            )),
            Err(e) => Err(CronHubError::PrivilegeUnavailable(format!(
                "not running as root and '{}' is unavailable: {e}",
                self.sudo_path
            ))),
        }
    }

    async fn build_process(&self, command: &Command) -> Result<Process> {
        let (mut program, mut args) = self.interpreter(command.shell, &command.script);
        if command.options.elevated_privileges {
            (program, args) = self.elevate(program, args).await?;
        }

        let mut process = Process::new(&program);
        process
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        process.process_group(0);
        #[cfg(not(unix))]
        process.kill_on_drop(true);

        if let Some(dir) = &command.options.working_directory {
            process.current_dir(shellexpand::tilde(dir).into_owned());
        }
        process.envs(&command.options.environment_variables);
        Ok(process)
    }
}

#[async_trait]
impl CommandBackend for CommandExecutor {
    async fn execute(&self, command: &Command) -> Result<CommandReport> {
        let mut process = self.build_process(command).await?;
        let mut child = process.spawn().map_err(|e| {
            CronHubError::Script(format!("failed to start {} script: {e}", command.shell))
        })?;
        // declared after `child` so it drops first
        let mut group = ProcessGroup::of(&child);

        let cap = self.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, stdout, stderr) =
            tokio::try_join!(child.wait(), capture(stdout, cap), capture(stderr, cap)).map_err(
                |e| CronHubError::Script(format!("{} script I/O failed: {e}", command.shell)),
            )?;
        group.disarm();

        let exit_code = status.code();
        let success = status.success();
        let save = command.options.save_output;

        tracing::debug!(
            "{} script exited with {:?} ({} bytes stdout, {} bytes stderr)",
            command.shell,
            exit_code,
            stdout.total,
            stderr.total
        );

        let (mut text, mut total) = if save {
            (stdout.text, stdout.total)
        } else {
            (String::new(), 0)
        };

        if success {
            if save && !stderr.text.trim().is_empty() {
                const MARKER: &str = "\n[stderr]\n";
                text.push_str(MARKER);
                text.push_str(&stderr.text);
                total += MARKER.len() + stderr.total;
            }
            return Ok(CommandReport {
                success: true,
                output: truncate_captured(&text, total, cap),
                error: None,
                exit_code,
            });
        }

        let error = if stderr.text.trim().is_empty() {
            match exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            truncate_captured(stderr.text.trim_end(), stderr.total, cap)
        };

        Ok(CommandReport {
            success: false,
            output: truncate_captured(&text, total, cap),
            error: Some(error),
            exit_code,
        })
    }
}

/// What was kept of one output stream, and how much it produced in all.
struct Captured {
    text: String,
    total: usize,
}

/// Drain `reader` to EOF, keeping at most `cap` bytes.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> std::io::Result<Captured> {
    let mut kept = Vec::new();
    let mut total = 0;
    if let Some(mut reader) = reader {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            total += n;
            let room = cap.saturating_sub(kept.len());
            kept.extend_from_slice(&chunk[..n.min(room)]);
        }
    }
    Ok(Captured {
        text: String::from_utf8_lossy(&kept).into_owned(),
        total,
    })
}

/// Kills the child's process group on drop unless disarmed.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            terminate_group(pgid);
        }
    }
}

/// SIGTERM the group now, SIGKILL it after [`KILL_GRACE`]. sudo relays the
/// SIGTERM to an elevated interpreter we may not signal ourselves.
#[cfg(unix)]
fn terminate_group(pgid: i32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pgid);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::debug!("SIGTERM to process group {pgid} failed: {e}");
        return;
    }
    tracing::debug!("Sent SIGTERM to process group {pgid}");
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                killpg(pgid, Signal::SIGKILL).ok();
            });
        }
        Err(_) => {
            killpg(pgid, Signal::SIGKILL).ok();
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pgid: i32) {}

/// Whether the current process already runs with root privileges.
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::Uid::effective().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn executor() -> CommandExecutor {
        CommandExecutor::new(&ExecutionConfig::default())
    }

    #[tokio::test]
    async fn test_echo_success() {
        let report = executor().execute(&Command::bash("echo hi")).await.unwrap();
        assert!(report.success);
        assert_eq!(report.output, "hi\n");
        assert_eq!(report.error, None);
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_uses_stderr() {
        let report = executor()
            .execute(&Command::bash("echo partial; echo boom >&2; exit 3"))
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.output, "partial\n");
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr() {
        let report = executor().execute(&Command::bash("exit 2")).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("exit status 2"));
    }

    #[tokio::test]
    async fn test_stderr_on_success_is_informational() {
        let report = executor()
            .execute(&Command::bash("echo ok; echo warning >&2"))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.error, None);
        assert!(report.output.starts_with("ok\n"));
        assert!(report.output.contains("[stderr]\nwarning"));
    }

    #[tokio::test]
    async fn test_save_output_disabled() {
        let mut cmd = Command::bash("echo secret");
        cmd.options.save_output = false;
        let report = executor().execute(&cmd).await.unwrap();
        assert!(report.success);
        assert!(report.output.is_empty());
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = std::env::temp_dir().join("cronhub-test-cmd-cwd");
        std::fs::create_dir_all(&dir).ok();
        let mut cmd = Command::bash("echo \"$GREETING\"; pwd");
        cmd.options
            .environment_variables
            .insert("GREETING".into(), "bonjour".into());
        cmd.options.working_directory = Some(dir.to_string_lossy().to_string());

        let report = executor().execute(&cmd).await.unwrap();
        assert!(report.success);
        let mut lines = report.output.lines();
        assert_eq!(lines.next(), Some("bonjour"));
        assert!(lines.next().unwrap_or_default().ends_with("cronhub-test-cmd-cwd"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let config = ExecutionConfig {
            max_output_bytes: 16,
            ..Default::default()
        };
        let report = CommandExecutor::new(&config)
            .execute(&Command::bash("printf 'x%.0s' $(seq 1 100)"))
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.output.starts_with(&"x".repeat(16)));
        assert!(report.output.contains("[truncated, 100 bytes total]"));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let config = ExecutionConfig {
            bash_path: "/nonexistent/bash".into(),
            ..Default::default()
        };
        let err = CommandExecutor::new(&config)
            .execute(&Command::bash("echo hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, CronHubError::Script(_)));
    }

    #[tokio::test]
    async fn test_elevation_honoured_or_fails_fast() {
        let config = ExecutionConfig {
            sudo_path: "/nonexistent/sudo".into(),
            ..Default::default()
        };
        let mut cmd = Command::bash("id -u");
        cmd.options.elevated_privileges = true;

        let result = CommandExecutor::new(&config).execute(&cmd).await;
        if is_privileged() {
            let report = result.unwrap();
            assert_eq!(report.output.trim(), "0");
        } else {
            assert!(matches!(result, Err(CronHubError::PrivilegeUnavailable(_))));
        }
    }

    #[tokio::test]
    async fn test_dropping_future_kills_whole_group() {
        let marker = std::env::temp_dir().join(format!("cronhub-pgroup-{}", std::process::id()));
        std::fs::remove_file(&marker).ok();
        let script = format!("(sleep 1; touch {}) & wait", marker.display());

        let exec = executor();
        let res = tokio::time::timeout(
            Duration::from_millis(200),
            exec.execute(&Command::bash(&script)),
        )
        .await;
        assert!(res.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background job survived cancellation");
        std::fs::remove_file(&marker).ok();
    }

    #[tokio::test]
    async fn test_chatty_output_is_capped_while_read() {
        let config = ExecutionConfig {
            max_output_bytes: 1024,
            ..Default::default()
        };
        let report = CommandExecutor::new(&config)
            .execute(&Command::bash("head -c 5000000 /dev/zero | tr '\\0' y"))
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.output.starts_with(&"y".repeat(1024)));
        assert!(report.output.ends_with("[truncated, 5000000 bytes total]"));
    }

    #[tokio::test]
    async fn test_dropping_future_kills_process() {
        let exec = executor();
        let cmd = Command::bash("sleep 5");
        let start = Instant::now();
        let res = tokio::time::timeout(Duration::from_millis(200), exec.execute(&cmd)).await;
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
