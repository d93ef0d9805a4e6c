//! Child process helpers shared by command providers and the tool executor.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> Option<i32> {
    if let Some(code) = code {
        return Some(code);
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return Some(128 + signal);
        }
    }
    None
}

/// Extract exit code from ExitStatus, using 128+signal for signal-terminated processes on Unix.
pub(crate) fn exit_status_code(status: &std::process::ExitStatus) -> Option<i32> {
    let code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(code, signal)
}

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub elapsed: Duration,
}

/// Errors from running a child process to completion.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RunError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("failed writing stdin: {0}")]
    Stdin(std::io::Error),

    #[error("failed reading {stream}: {source}")]
    Read {
        stream: &'static str,
        source: std::io::Error,
    },

    #[error("failed waiting for process: {0}")]
    Wait(std::io::Error),
}

/// Spawn `cmd`, feed `input` on stdin, and wait for it with a timeout.
///
/// The child is killed when the timeout fires or a pipe fails.
pub(crate) async fn run_with_input(
    mut cmd: Command,
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, RunError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|source| RunError::Spawn { program, source })?;

    if let Some(text) = input
        && let Some(mut stdin) = child.stdin.take()
    {
        let bytes = text.as_bytes().to_vec();
        // stdin is fed concurrently with the output pumps
        tokio::spawn(async move {
            let _ = stdin.write_all(&bytes).await;
            let _ = stdin.shutdown().await;
        });
    }

    let waited = tokio::time::timeout(timeout, wait_for_child_output(&mut child)).await;
    let elapsed = start.elapsed();

    match waited {
        Ok(Ok((stdout, stderr, status))) => Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: exit_status_code(&status),
            success: status.success(),
            elapsed,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(RunError::Timeout { elapsed })
        }
    }
}

/// Wait for child output, reading stdout/stderr concurrently to avoid deadlock.
async fn wait_for_child_output(
    child: &mut Child,
) -> Result<(String, String, std::process::ExitStatus), RunError> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_fut = async move {
        let mut buf = String::new();
        if let Some(mut out) = stdout_pipe {
            out.read_to_string(&mut buf)
                .await
                .map_err(|source| RunError::Read {
                    stream: "stdout",
                    source,
                })?;
        }
        Ok::<_, RunError>(buf)
    };

    let stderr_fut = async move {
        let mut buf = String::new();
        if let Some(mut err) = stderr_pipe {
            err.read_to_string(&mut buf)
                .await
                .map_err(|source| RunError::Read {
                    stream: "stderr",
                    source,
                })?;
        }
        Ok::<_, RunError>(buf)
    };

    let (stdout, stderr) = match tokio::try_join!(stdout_fut, stderr_fut) {
        Ok(result) => result,
        Err(e) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(e);
        }
    };

    let status = child.wait().await.map_err(RunError::Wait)?;
    Ok((stdout, stderr, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn exit_code_passthrough() {
        assert_eq!(exit_status_code_parts(Some(0), None), Some(0));
        assert_eq!(exit_status_code_parts(Some(42), None), Some(42));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_code() {
        // SIGKILL (9) -> 128 + 9 = 137
        assert_eq!(exit_status_code_parts(None, Some(9)), Some(137));
        assert_eq!(exit_status_code_parts(None, Some(15)), Some(143));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_both_streams() {
        let out = run_with_input(
            sh("printf 'stdout'; printf 'stderr' >&2"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "stdout");
        assert_eq!(out.stderr, "stderr");
        assert!(out.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_piped() {
        let out = run_with_input(sh("tr a-z A-Z"), Some("hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "HELLO");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit() {
        let out = run_with_input(sh("printf 'output'; exit 42"), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(42));
        assert_eq!(out.stdout, "output");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let result = run_with_input(sh("sleep 10"), None, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RunError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = Command::new("definitely_not_a_real_command_12345");
        let result = run_with_input(cmd, None, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RunError::Spawn { .. })));
    }
}
