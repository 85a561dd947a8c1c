//! Tool-execution boundary and the shell-backed executor.
//!
//! An executor runs a program with an environment and stdin input and
//! returns its output. Deadline and non-zero-exit failures become a normal
//! tool output describing the failure so the model can react; anything else
//! is a hard error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Failure reported by an executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("exited with status {code}: {output}")]
    NonZeroExit { code: i32, output: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `program` with `env` applied and `input` on stdin. Must stop
    /// promptly once `cancel` fires.
    async fn run(
        &self,
        program: &str,
        env: &BTreeMap<String, String>,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, ExecError>;
}

/// Map an executor result onto a tool output or a hard failure.
pub fn translate_outcome(name: &str, result: Result<String, ExecError>) -> Result<String, ToolError> {
    match result {
        Ok(output) => Ok(output),
        Err(ExecError::DeadlineExceeded(after)) => {
            Ok(format!("error: {name} did not finish within {}s", after.as_secs()))
        }
        Err(ExecError::NonZeroExit { code, output }) => {
            Ok(format!("error: {name} exited with status {code}\n{output}"))
        }
        Err(ExecError::Cancelled) => Err(ToolError::Cancelled {
            name: name.to_string(),
        }),
        Err(ExecError::Other(reason)) => Err(ToolError::ExecutionFailed {
            name: name.to_string(),
            reason,
        }),
    }
}

/// Runs programs through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            working_dir: None,
        }
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ShellExecutor {
    async fn run(
        &self,
        program: &str,
        env: &BTreeMap<String, String>,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, ExecError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", program])
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::Other(format!("Failed to spawn command: {e}")))?;

        // Stdin is fed from its own task so a child that never reads it
        // cannot hold off the deadline or cancellation.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.as_bytes().to_vec();
            tokio::spawn(async move {
                if !input.is_empty() {
                    if let Err(e) = stdin.write_all(&input).await {
                        tracing::debug!(error = %e, "Child stopped reading stdin");
                    }
                }
            })
        });

        // Dropping the wait future drops the child, which kills it.
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(ExecError::Other(format!("Command execution failed: {e}"))),
                Err(_) => Err(ExecError::DeadlineExceeded(self.timeout)),
            },
        };
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = result?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };
        let combined = truncate_output(&combined);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ExecError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail_start..]
    )
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn input_goes_to_stdin() {
        let out = ShellExecutor::new()
            .run("cat", &no_env(), "from stdin", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "from stdin");
    }

    #[tokio::test]
    async fn env_is_applied() {
        let mut env = no_env();
        env.insert("GREETING".into(), "hi there".into());
        let out = ShellExecutor::new()
            .run("printf %s \"$GREETING\"", &env, "", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "hi there");
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_output() {
        let result = ShellExecutor::new()
            .run("echo oops >&2; exit 3", &no_env(), "", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExecError::NonZeroExit { code: 3, .. })));

        let output = translate_outcome("sys_shell", result).unwrap();
        assert!(output.contains("status 3"));
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_becomes_output() {
        let result = ShellExecutor::new()
            .with_timeout(Duration::from_millis(100))
            .run("sleep 5", &no_env(), "", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExecError::DeadlineExceeded(_))));
        assert!(translate_outcome("sys_shell", result).is_ok());
    }

    #[tokio::test]
    async fn cancellation_is_a_hard_error() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });
        let started = std::time::Instant::now();
        let result = ShellExecutor::new().run("sleep 5", &no_env(), "", cancel).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            translate_outcome("sys_shell", result),
            Err(ToolError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn unread_stdin_does_not_block_deadline() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trip.cancel();
        });
        let input = "x".repeat(1024 * 1024);
        let started = std::time::Instant::now();
        let result = ShellExecutor::new()
            .with_timeout(Duration::from_millis(200))
            .run("sleep 30", &no_env(), &input, cancel)
            .await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(result, Err(ExecError::DeadlineExceeded(_))));
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() < s.len());
        assert!(result.contains("[truncated"));
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "héllo";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }
}
