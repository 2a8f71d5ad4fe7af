//! Process Executor (§4.B).
//!
//! Spawns an agent's subprocess, merges stdout and stderr into a single
//! timestamped log file, and enforces cancellation with a soft-signal,
//! grace-period, hard-kill sequence. Unlike the teacher's harness adapters
//! (which parse the child's stdout as structured JSONL), the Executor only
//! ever deals in raw bytes — parsing the agent's own notion of "done" is
//! the Agent Loop's job, not this component's.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecutorError;

/// The outcome of a completed (not cancelled) process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Run `command` with `args` and `env`, writing merged stdout/stderr to
/// `log_path` (creating parent directories as needed), honoring
/// `cancel` for soft-then-hard termination with `kill_grace_period`
/// between the two. Returns the process's exit code, or a structured
/// [`ExecutorError`] on spawn/timeout/non-zero-exit.
pub async fn run(
    command: &str,
    args: &[String],
    env: &[(String, String)],
    working_dir: &Path,
    stdin: Option<&str>,
    log_path: &Path,
    cancel: CancellationToken,
    kill_grace_period: Duration,
) -> Result<ExitStatus, ExecutorError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(ExecutorError::Spawn)?;
    }

    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
    let pid = child.id();

    if let (Some(input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
        use tokio::io::AsyncWriteExt;
        let _ = child_stdin.write_all(input.as_bytes()).await;
        drop(child_stdin);
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let mut log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(ExecutorError::Spawn)?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut tail = Vec::new();

    loop {
        if out_done && err_done {
            break;
        }
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return cancel_process(child, pid, kill_grace_period).await;
            }

            line = out_lines.next_line(), if !out_done => {
                match line {
                    Ok(Some(text)) => write_log_line(&mut log_file, &text, &mut tail),
                    Ok(None) => out_done = true,
                    Err(e) => { warn!(error = %e, "error reading stdout"); out_done = true; }
                }
            }

            line = err_lines.next_line(), if !err_done => {
                match line {
                    Ok(Some(text)) => write_log_line(&mut log_file, &text, &mut tail),
                    Ok(None) => err_done = true,
                    Err(e) => { warn!(error = %e, "error reading stderr"); err_done = true; }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => return cancel_process(child, pid, kill_grace_period).await,
        status = child.wait() => status.map_err(ExecutorError::Spawn)?,
    };

    let _ = log_file.sync_all();

    let code = status.code().unwrap_or(-1);
    if code != 0 {
        return Err(ExecutorError::NonZeroExit {
            code,
            tail: tail_as_string(&tail),
        });
    }

    Ok(ExitStatus { code })
}

const TAIL_MAX_BYTES: usize = 4096;

fn write_log_line(file: &mut std::fs::File, line: &str, tail: &mut Vec<u8>) {
    let timestamp = Local::now().format("%H:%M:%S");
    let prefixed = format!("[{timestamp}] {line}\n");
    if let Err(e) = file.write_all(prefixed.as_bytes()) {
        warn!(error = %e, "failed to write log line");
    }
    tail.extend_from_slice(prefixed.as_bytes());
    if tail.len() > TAIL_MAX_BYTES {
        let excess = tail.len() - TAIL_MAX_BYTES;
        tail.drain(0..excess);
    }
}

fn tail_as_string(tail: &[u8]) -> String {
    String::from_utf8_lossy(tail).into_owned()
}

async fn cancel_process(
    mut child: tokio::process::Child,
    pid: Option<u32>,
    grace_period: Duration,
) -> Result<ExitStatus, ExecutorError> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: pid is a valid child pid we spawned and still hold a handle to.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed during cancellation");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("process exited after soft cancel");
            Ok(ExitStatus { code: status.code().unwrap_or(-1) })
        }
        _ => {
            debug!("process did not exit within grace period, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(ExecutorError::Timeout {
                elapsed_secs: grace_period.as_secs(),
            })
        }
    }
}

#[allow(dead_code)]
fn ensure_log_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating log directory")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_captures_stdout_and_stderr_with_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("logs").join("run-001.log");

        let status = run(
            "sh",
            &["-c".to_string(), "echo out-line; echo err-line 1>&2".to_string()],
            &[],
            tmp.path(),
            None,
            &log_path,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(status.is_success());
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("out-line"));
        assert!(contents.contains("err-line"));
        // "[HH:MM:SS] " prefix.
        assert!(contents.lines().next().unwrap().starts_with('['));
    }

    #[tokio::test]
    async fn run_reports_non_zero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run-002.log");

        let err = run(
            "sh",
            &["-c".to_string(), "echo boom; exit 7".to_string()],
            &[],
            tmp.path(),
            None,
            &log_path,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        match err {
            ExecutorError::NonZeroExit { code, tail } => {
                assert_eq!(code, 7);
                assert!(tail.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_reports_spawn_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run-003.log");

        let err = run(
            "/nonexistent/binary/path",
            &[],
            &[],
            tmp.path(),
            None,
            &log_path,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExecutorError::Spawn(_)));
    }

    #[tokio::test]
    async fn run_cancellation_kills_long_running_process() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run-004.log");
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let err = run(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &[],
            tmp.path(),
            None,
            &log_path,
            cancel,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExecutorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn run_passes_env_vars() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run-005.log");

        let status = run(
            "sh",
            &["-c".to_string(), "echo $FOREMAN_TEST_VAR".to_string()],
            &[("FOREMAN_TEST_VAR".to_string(), "hello".to_string())],
            tmp.path(),
            None,
            &log_path,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(status.is_success());
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn run_writes_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run-006.log");

        let status = run(
            "sh",
            &["-c".to_string(), "cat".to_string()],
            &[],
            tmp.path(),
            Some("from stdin\n"),
            &log_path,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(status.is_success());
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("from stdin"));
    }
}
