//! Shell command execution.
//!
//! Commands run through the OS shell (`sh -c` on Unix, `cmd /C` on Windows)
//! so operators can use pipes, redirections, and builtins. The executor
//! enforces a wall-clock timeout, captures both streams to memory, and owns
//! the child process tree: on timeout or cancellation the whole group is
//! killed, never leaked. It performs no retries and no store access.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Sentinel exit code reported when no real one exists: the child timed out,
/// was killed by a signal, or could not be spawned at all.
pub const EXIT_CODE_FAILURE: i64 = -1;

/// Result of a single command execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// The child's exit code, or [`EXIT_CODE_FAILURE`].
    pub exit_code: i64,
    /// Captured stdout (lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8).
    pub stderr: String,
    /// Whether the wall-clock timeout fired.
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Whether the execution counts as a success: exit code 0 and no timeout.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// One-line failure description for the job's `last_error` column.
    pub fn failure_message(&self, timeout: Duration) -> String {
        if self.timed_out {
            format!("timed out after {}s", timeout.as_secs())
        } else {
            format!("exit code {}: {}", self.exit_code, self.stderr.trim())
        }
    }
}

/// Runs `command` through the OS shell with a wall-clock `timeout`.
///
/// Never fails: a shell that cannot be spawned is reported as a failed
/// outcome, exactly like a non-zero exit, so the caller's retry logic covers
/// both.
pub async fn run(command: &str, timeout: Duration) -> ExecOutcome {
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so a timeout kill reaches the whole tree and not
    // just the shell.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, "Failed to spawn shell");
            return ExecOutcome {
                exit_code: EXIT_CODE_FAILURE,
                stdout: String::new(),
                stderr: format!("failed to spawn shell: {err}"),
                timed_out: false,
            };
        }
    };

    // Drain both pipes while waiting, or a chatty child fills the pipe
    // buffer and deadlocks against our wait().
    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let (status, timed_out) = tokio::select! {
        status = child.wait() => (status, false),
        () = tokio::time::sleep(timeout) => {
            debug!(timeout_secs = timeout.as_secs(), "Command timed out, killing process tree");
            kill_tree(&mut child).await;
            (child.wait().await, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let exit_code = if timed_out {
        EXIT_CODE_FAILURE
    } else {
        match status {
            Ok(status) => status.code().map_or(EXIT_CODE_FAILURE, i64::from),
            Err(err) => {
                warn!(%err, "Failed to wait for child");
                EXIT_CODE_FAILURE
            }
        }
    };

    ExecOutcome {
        exit_code,
        stdout,
        stderr,
        timed_out,
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }

    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
}

async fn drain<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(%err, pid, "Failed to kill process group");
        }
    }

    if let Err(err) = child.kill().await {
        warn!(%err, "Failed to kill child");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let outcome = run("echo out; echo err >&2; exit 3", Duration::from_secs(5)).await;
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert!(!outcome.timed_out);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn success_requires_exit_zero() {
        let outcome = run("true", Duration::from_secs(5)).await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = std::time::Instant::now();
        let outcome = run("sleep 30", Duration::from_millis(200)).await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, EXIT_CODE_FAILURE);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shell_features_are_available() {
        let outcome = run("printf 'a\\nb\\nc' | wc -l", Duration::from_secs(5)).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.trim(), "2");
    }

    #[tokio::test]
    async fn unspawnable_command_is_a_failure_outcome() {
        let outcome = run("/definitely/not/a/shell/builtin", Duration::from_secs(5)).await;
        assert!(!outcome.succeeded());
        assert!(!outcome.timed_out);
    }
}
