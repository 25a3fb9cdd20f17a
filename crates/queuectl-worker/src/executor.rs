//! Execute job commands through the system shell.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use queuectl_core::Execution;

/// Runs a job's command to completion.
///
/// Failures of the command itself are values, never errors.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str) -> Execution;
}

/// Executes commands with `sh -c` (`cmd /C` on Windows).
///
/// Both streams are captured in full. There is no timeout: a command that
/// never exits blocks its worker.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    flag: String,
}

impl ShellExecutor {
    /// Create an executor using the platform shell.
    pub fn new() -> Self {
        if cfg!(windows) {
            Self::with_shell("cmd", "/C")
        } else {
            Self::with_shell("sh", "-c")
        }
    }

    /// Create an executor with a custom interpreter, invoked as `<shell> <flag> <command>`.
    pub fn with_shell(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str) -> Execution {
        debug!(shell = %self.shell, command, "launching command");

        let result = Command::new(&self.shell)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if output.status.success() {
                    debug!(output_len = stdout.len(), "command succeeded");
                    return Execution::Succeeded {
                        output: stdout,
                        error: stderr,
                    };
                }

                let error = if stderr.trim().is_empty() {
                    exit_message(output.status)
                } else {
                    stderr
                };
                Execution::Failed {
                    output: stdout,
                    error,
                }
            }
            Err(e) => {
                warn!(shell = %self.shell, error = %e, "failed to launch command");
                Execution::Failed {
                    output: String::new(),
                    error: format!("failed to launch command: {e}"),
                }
            }
        }
    }
}

fn exit_message(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("process exited with code {code}"),
        None => signal_message(status),
    }
}

#[cfg(unix)]
fn signal_message(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("process terminated by signal {signal}"),
        None => "process exited abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_message(_status: ExitStatus) -> String {
    "process exited abnormally".to_string()
}
