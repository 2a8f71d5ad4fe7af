//! Log Tailer (§4.C).
//!
//! Follows a run's log file as the Executor appends to it, emitting one
//! event per complete line. Never deletes the file — an `AgentRun`'s log
//! outlives the tailer that watched it.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One line emitted by the tailer. `continuation` is true for the
/// overflow chunks of a line longer than `max_line_bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub run_id: Uuid,
    pub line_number: u64,
    pub text: String,
    pub continuation: bool,
}

/// Start tailing `log_path` for `run_id`, polling at `poll_interval` and
/// splitting lines longer than `max_line_bytes`. Returns a receiver of
/// [`TailedLine`]s and a `CancellationToken` the caller can cancel to stop
/// early (e.g. once the Executor reports the process has exited and the
/// file has been fully drained).
pub fn start_tailing(
    run_id: Uuid,
    log_path: PathBuf,
    poll_interval: Duration,
    max_line_bytes: usize,
) -> (mpsc::Receiver<TailedLine>, CancellationToken) {
    let (tx, rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let cancel_inner = cancel.clone();

    tokio::spawn(async move {
        run_tail_loop(run_id, log_path, poll_interval, max_line_bytes, tx, cancel_inner).await;
    });

    (rx, cancel)
}

async fn run_tail_loop(
    run_id: Uuid,
    log_path: PathBuf,
    poll_interval: Duration,
    max_line_bytes: usize,
    tx: mpsc::Sender<TailedLine>,
    cancel: CancellationToken,
) {
    let mut offset: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();
    let mut line_number: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match std::fs::File::open(&log_path) {
            Ok(mut file) => {
                if file.seek(SeekFrom::Start(offset)).is_err() {
                    break;
                }
                let mut buf = Vec::new();
                if file.read_to_end(&mut buf).is_err() {
                    break;
                }
                offset += buf.len() as u64;
                pending.extend_from_slice(&buf);

                loop {
                    let newline_pos = pending.iter().position(|&b| b == b'\n');
                    let split_at = match newline_pos {
                        Some(pos) => pos,
                        None if pending.len() >= max_line_bytes => max_line_bytes,
                        None => break,
                    };

                    let is_continuation_chunk = newline_pos.is_none();
                    let chunk: Vec<u8> = pending.drain(0..split_at).collect();
                    if !is_continuation_chunk {
                        // Drop the newline itself.
                        if !pending.is_empty() {
                            pending.remove(0);
                        }
                    }

                    line_number += 1;
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    if tx
                        .send(TailedLine {
                            run_id,
                            line_number,
                            text,
                            continuation: is_continuation_chunk,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(_) => {
                // File not created yet; keep polling.
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn tails_complete_lines_as_they_are_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.log");
        std::fs::write(&log_path, "").unwrap();

        let run_id = Uuid::new_v4();
        let (mut rx, cancel) =
            start_tailing(run_id, log_path.clone(), Duration::from_millis(10), 1024);

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(f, "first line").unwrap();
        }

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "first line");
        assert_eq!(line.line_number, 1);
        assert!(!line.continuation);

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(f, "second line").unwrap();
        }

        let line2 = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line2.text, "second line");
        assert_eq!(line2.line_number, 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn splits_overlong_lines_as_continuations() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.log");
        let long_line = "x".repeat(50);
        std::fs::write(&log_path, format!("{long_line}\n")).unwrap();

        let run_id = Uuid::new_v4();
        let (mut rx, cancel) = start_tailing(run_id, log_path, Duration::from_millis(10), 10);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text.len(), 10);
        assert!(first.continuation);

        cancel.cancel();
    }

    #[tokio::test]
    async fn tolerates_missing_file_until_created() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("not-yet.log");

        let run_id = Uuid::new_v4();
        let (mut rx, cancel) =
            start_tailing(run_id, log_path.clone(), Duration::from_millis(10), 1024);

        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&log_path, "hello\n").unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "hello");

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_stops_emitting_new_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.log");
        std::fs::write(&log_path, "").unwrap();

        let run_id = Uuid::new_v4();
        let (mut rx, cancel) =
            start_tailing(run_id, log_path.clone(), Duration::from_millis(10), 1024);
        cancel.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(f, "after cancel").unwrap();
        }

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err() || result.unwrap().is_none());
    }
}
