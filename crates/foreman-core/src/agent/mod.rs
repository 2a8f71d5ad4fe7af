//! Agent Loop (§4.I, the hardest component).
//!
//! Runs *one attempt* for either a Planner (bound to a Task) or a Worker
//! (bound to a Subtask): allocates an `AgentRun`, starts the Log Tailer,
//! spawns the subprocess via the Executor, waits for the outcome, and
//! drives the parent Task/Subtask through its state machine on success or
//! failure.
//!
//! Adapted from the teacher's `lifecycle::run_agent_lifecycle`: the overall
//! shape — allocate, spawn, wait, evaluate, transition — is unchanged, but
//! gate/invariant evaluation is replaced by the tracker-outcome check of
//! §4.I.4, and the Planner/Worker split (the teacher has no Planner
//! equivalent) is modeled as the `AgentKind` tagged variant called for in
//! §9's "Polymorphism across Planner/Worker" note.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_db::models::{AgentRun, Project, SubtaskStatus, TaskStatus};
use foreman_db::queries::{agent_runs as runs_db, subtasks as subtasks_db, tasks as tasks_db};
use sqlx::PgPool;

use crate::config::ServiceConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_hub::{Event, EventHub};
use crate::executor;
use crate::github::GitHubClient;
use crate::prompt;
use crate::resolver;
use crate::state::dispatch;
use crate::state::TaskStateMachine;
use crate::sync;
use crate::tailer;
use crate::tracker::TrackerClient;
use crate::worktree::WorktreeManager;

/// Which role an attempt is executing (§9).
#[derive(Debug, Clone, Copy)]
pub enum AgentKind {
    Plan { task_id: Uuid },
    Work { subtask_id: Uuid },
}

/// What `prepare()` hands the Executor: where to run, what to feed on
/// stdin, and what environment to carry (§4.I.2).
struct AttemptContext {
    working_dir: PathBuf,
    prompt: String,
    env: Vec<(String, String)>,
}

/// Outcome of one completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    FailedWillRetry { next_attempt_at_secs: u64 },
    FailedTerminal,
}

/// Everything an attempt needs beyond the Task/Subtask it targets. Built
/// once per project and shared across every attempt for that project.
#[derive(Clone)]
pub struct AgentRunner {
    pool: PgPool,
    config: ServiceConfig,
    event_hub: EventHub,
    tracker: TrackerClient,
    worktree: WorktreeManager,
    project: Project,
    agent_command: String,
    agent_args: Vec<String>,
}

impl AgentRunner {
    pub fn new(
        pool: PgPool,
        config: ServiceConfig,
        event_hub: EventHub,
        tracker: TrackerClient,
        worktree: WorktreeManager,
        project: Project,
        agent_command: String,
        agent_args: Vec<String>,
    ) -> Self {
        Self {
            pool,
            config,
            event_hub,
            tracker,
            worktree,
            project,
            agent_command,
            agent_args,
        }
    }

    /// Run one attempt of `kind` to completion, including the retry-decision
    /// and state-machine transitions. Returns once the attempt has reached
    /// a terminal outcome for this call (a scheduled retry is reported, not
    /// awaited — the caller schedules the next attempt itself, e.g. via a
    /// `tokio::time::sleep` on its own task).
    pub async fn run_attempt(&self, kind: AgentKind, cancel: CancellationToken) -> Result<AttemptOutcome> {
        let ctx = self.prepare(kind).await?;
        let run = self.allocate_run(kind, &ctx.prompt).await?;

        self.event_hub
            .publish(self.project.id, Event::new("agent:started", StartedPayload {
                run_id: run.id,
                kind: kind_label(kind),
            }))
            .await;

        let log_path = PathBuf::from(&run.log_path);
        let (mut tail_rx, tail_cancel) =
            tailer::start_tailing(run.id, log_path.clone(), self.config.tailer.poll_interval, self.config.tailer.max_line_bytes);

        let hub = self.event_hub.clone();
        let project_id = self.project.id;
        let forward_run_id = run.id;
        let forward_task = tokio::spawn(async move {
            while let Some(line) = tail_rx.recv().await {
                hub.publish(
                    project_id,
                    Event::new(
                        "agent:log",
                        LogPayload {
                            run_id: forward_run_id,
                            line_number: line.line_number,
                            text: line.text,
                            continuation: line.continuation,
                        },
                    ),
                )
                .await;
            }
        });

        let exec_result = executor::run(
            &self.agent_command,
            &self.agent_args,
            &ctx.env,
            &ctx.working_dir,
            Some(&ctx.prompt),
            &log_path,
            cancel,
            self.config.executor.kill_grace_period,
        )
        .await;

        tail_cancel.cancel();
        let _ = forward_task.await;

        let outcome: Result<()> = match exec_result {
            Ok(_) => self.evaluate_success(kind, &log_path).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => {
                runs_db::complete_run_succeeded(&self.pool, run.id, extract_token_usage(&log_path)).await?;
                self.event_hub
                    .publish(self.project.id, Event::new("agent:completed", CompletedPayload { run_id: run.id }))
                    .await;
                Ok(AttemptOutcome::Succeeded)
            }
            Err(e) => {
                let error_message = truncate_for_storage(&e.to_string());
                runs_db::complete_run_failed(&self.pool, run.id, &error_message).await?;
                self.on_failure(kind, &error_message).await
            }
        }
    }

    /// `prepare() → (workdir, prompt, env)` (§9).
    async fn prepare(&self, kind: AgentKind) -> Result<AttemptContext> {
        let token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        let env = vec![("GITHUB_TOKEN".to_string(), token)];

        match kind {
            AgentKind::Plan { task_id } => {
                let task = tasks_db::get_task(&self.pool, task_id)
                    .await?
                    .ok_or(CoreError::NotFound { kind: "task", id: task_id })?;
                Ok(AttemptContext {
                    working_dir: PathBuf::from(&self.project.clone_path),
                    prompt: prompt::render_planner_prompt(&task),
                    env,
                })
            }
            AgentKind::Work { subtask_id } => {
                let subtask = subtasks_db::get_subtask(&self.pool, subtask_id)
                    .await?
                    .ok_or(CoreError::NotFound { kind: "subtask", id: subtask_id })?;
                let info = self.worktree.provision(&self.pool, &subtask).await.context("provisioning worktree")?;
                let rendered = prompt::render_worker_prompt(&self.pool, &subtask).await?;
                Ok(AttemptContext { working_dir: info.path, prompt: rendered, env })
            }
        }
    }

    async fn allocate_run(&self, kind: AgentKind, prompt_text: &str) -> Result<AgentRun> {
        match kind {
            AgentKind::Plan { task_id } => {
                let attempt = runs_db::next_attempt_number_for_task(&self.pool, task_id).await?;
                let log_path = self.config.log_dir(self.project.id, task_id, "__planner__").join(format!("run-{attempt:03}.log"));
                runs_db::insert_planner_run(&self.pool, task_id, attempt, &log_path.to_string_lossy(), prompt_text).await
            }
            AgentKind::Work { subtask_id } => {
                let subtask = subtasks_db::get_subtask(&self.pool, subtask_id)
                    .await?
                    .ok_or(CoreError::NotFound { kind: "subtask", id: subtask_id })?;
                let attempt = runs_db::next_attempt_number_for_subtask(&self.pool, subtask_id).await?;
                let log_path = self
                    .config
                    .log_dir(self.project.id, subtask.task_id, &subtask_id.to_string())
                    .join(format!("run-{attempt:03}.log"));
                runs_db::insert_worker_run(&self.pool, subtask_id, attempt, &log_path.to_string_lossy(), prompt_text).await
            }
        }
    }

    /// `onSuccess()` (§9): §4.I.5's success path. Evaluates the outcome
    /// check of §4.I.4 first, surfacing a failure if the tracker doesn't
    /// show the expected effect even though the process exited 0.
    async fn evaluate_success(&self, kind: AgentKind, log_path: &std::path::Path) -> Result<()> {
        match kind {
            AgentKind::Plan { task_id } => {
                let task = tasks_db::get_task(&self.pool, task_id)
                    .await?
                    .ok_or(CoreError::NotFound { kind: "task", id: task_id })?;

                let epic_id = match &task.tracker_epic_id {
                    Some(id) => id.clone(),
                    None => {
                        let discovered = extract_tracker_epic_id(log_path).context(
                            "planner exited 0 but printed no TRACKER_EPIC marker and the task has no epic on record",
                        )?;
                        tasks_db::set_tracker_epic_id(&self.pool, task_id, &discovered)
                            .await
                            .context("persisting discovered tracker epic")?;
                        discovered
                    }
                };

                let worktree = PathBuf::from(&self.project.clone_path);
                let issues = self.tracker.list_under_epic(&worktree, &epic_id)?;
                if issues.is_empty() {
                    anyhow::bail!("planner reported success but filed no tracker issues");
                }

                sync::sync_task(&self.pool, &self.tracker, &worktree, task_id).await?;
                let mut conn = self.pool.acquire().await.context("acquiring connection")?;
                dispatch::activate_task(&mut conn, task_id).await?;
                drop(conn);

                self.event_hub
                    .publish(
                        self.project.id,
                        Event::new("task:status_changed", StatusChangedPayload {
                            id: task_id,
                            from: task.status.to_string(),
                            to: TaskStatus::Active.to_string(),
                        }),
                    )
                    .await;

                Ok(())
            }
            AgentKind::Work { subtask_id } => {
                let subtask = subtasks_db::get_subtask(&self.pool, subtask_id)
                    .await?
                    .ok_or(CoreError::NotFound { kind: "subtask", id: subtask_id })?;

                let branch_name = subtask
                    .branch_name
                    .clone()
                    .context("subtask has no branch assigned")?;

                if let Some(issue_id) = &subtask.tracker_issue_id {
                    let worktree = subtask
                        .worktree_path
                        .as_deref()
                        .map(PathBuf::from)
                        .context("subtask has no worktree assigned")?;
                    let issue = self.tracker.show(&worktree, issue_id)?;
                    if !issue.closed {
                        anyhow::bail!("worker exited 0 but did not close tracker issue {issue_id}");
                    }
                }

                self.push_branch(&branch_name)?;
                let github = GitHubClient::for_project(&self.project.owner_repo).context("building GitHub client")?;
                let pr = github
                    .create_pull_request(
                        &format!("{}: {}", self.project.tracker_prefix, subtask.title),
                        &format!("Implements subtask `{}`.", subtask.title),
                        &branch_name,
                        &self.project.default_branch,
                    )
                    .await
                    .context("opening pull request")?;

                subtasks_db::mark_completed_with_pr(&self.pool, subtask_id, &branch_name, &pr.html_url, pr.number).await?;

                self.event_hub
                    .publish(
                        self.project.id,
                        Event::new("subtask:status_changed", StatusChangedPayload {
                            id: subtask_id,
                            from: subtask.status.to_string(),
                            to: SubtaskStatus::Completed.to_string(),
                        }),
                    )
                    .await;

                Ok(())
            }
        }
    }

    /// Push `branch_name` to `origin`. Shelling out mirrors the Worktree
    /// Manager's own approach to git plumbing rather than introducing a
    /// second way of talking to git.
    fn push_branch(&self, branch_name: &str) -> Result<()> {
        let output = std::process::Command::new("git")
            .args(["push", "origin", branch_name])
            .current_dir(self.worktree.repo_path())
            .output()
            .context("failed to run git push")?;

        if !output.status.success() {
            anyhow::bail!("git push failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    /// `onFailure()` (§9): §4.I.6's failure path — increment retry count,
    /// either schedule a retry or transition to a terminal blocked state.
    async fn on_failure(&self, kind: AgentKind, error_message: &str) -> Result<AttemptOutcome> {
        let max_retries = self.config.agent_loop.max_retries;

        match kind {
            AgentKind::Plan { task_id } => {
                // Tasks don't carry a retry_count column; a failed planning
                // attempt always surfaces for the user to retry explicitly.
                let mut conn = self.pool.acquire().await.context("acquiring connection")?;
                dispatch::fail_planning(&mut conn, task_id).await?;
                drop(conn);
                self.event_hub
                    .publish(
                        self.project.id,
                        Event::new("agent:failed", FailedPayload { will_retry: false, next_attempt_at_secs: None }),
                    )
                    .await;
                tracing::warn!(task_id = %task_id, error = error_message, "planner attempt failed, awaiting manual retry");
                Ok(AttemptOutcome::FailedTerminal)
            }
            AgentKind::Work { subtask_id } => {
                let retry_count = subtasks_db::increment_retry_count(&self.pool, subtask_id).await?;

                if (retry_count as u32) < max_retries {
                    let backoff = self.config.agent_loop.backoff(retry_count as u32);
                    self.event_hub
                        .publish(
                            self.project.id,
                            Event::new(
                                "agent:failed",
                                FailedPayload { will_retry: true, next_attempt_at_secs: Some(backoff.as_secs()) },
                            ),
                        )
                        .await;
                    tracing::warn!(subtask_id = %subtask_id, retry_count, error = error_message, "worker attempt failed, will retry");
                    Ok(AttemptOutcome::FailedWillRetry { next_attempt_at_secs: backoff.as_secs() })
                } else {
                    let mut conn = self.pool.acquire().await.context("acquiring connection")?;
                    dispatch::block_on_failure(&mut conn, subtask_id).await?;
                    drop(conn);
                    self.event_hub
                        .publish(
                            self.project.id,
                            Event::new("agent:failed", FailedPayload { will_retry: false, next_attempt_at_secs: None }),
                        )
                        .await;
                    tracing::warn!(subtask_id = %subtask_id, retry_count, "worker exhausted retries, blocking on failure");
                    Ok(AttemptOutcome::FailedTerminal)
                }
            }
        }
    }

    /// Mark a subtask `MERGED` once its PR lands, unblocking dependents and
    /// completing the parent task if every subtask is now merged (I7).
    ///
    /// Runs inside a single transaction (§4.A): the merge transition, the
    /// unblock cascade, and the parent-task completion check all commit
    /// together or not at all. Events are published only after the commit
    /// succeeds, never before.
    pub async fn record_merge(&self, subtask_id: Uuid) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        dispatch::mark_merged(&mut *tx, subtask_id).await?;
        let unblocked = resolver::on_merged(&mut *tx, subtask_id).await?;

        let subtask = subtasks_db::get_subtask(&mut *tx, subtask_id)
            .await?
            .ok_or(CoreError::NotFound { kind: "subtask", id: subtask_id })?;

        let task_done = TaskStateMachine::complete_if_all_merged(&mut *tx, subtask.task_id).await?;

        tx.commit().await?;

        for dependent_id in &unblocked {
            self.event_hub
                .publish(
                    self.project.id,
                    Event::new(
                        "subtask:unblocked",
                        UnblockedPayload { subtask_id: *dependent_id, unblocked_by_id: subtask_id },
                    ),
                )
                .await;
        }

        if task_done {
            self.event_hub
                .publish(
                    self.project.id,
                    Event::new(
                        "task:status_changed",
                        StatusChangedPayload {
                            id: subtask.task_id,
                            from: TaskStatus::Active.to_string(),
                            to: TaskStatus::Done.to_string(),
                        },
                    ),
                )
                .await;
        }

        Ok(())
    }
}

/// Orphan recovery (§4.I): run once on process start, before accepting any
/// requests. Every `RUNNING` run older than `orphan_grace_window` is marked
/// `FAILED`, and returned so the caller can decide whether to reschedule.
pub async fn reap_orphaned_runs(pool: &PgPool, orphan_grace_window: Duration) -> Result<Vec<AgentRun>> {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(orphan_grace_window).unwrap_or_default();
    let reaped = runs_db::mark_stale_runs_failed(pool, cutoff).await?;
    for orphan in &reaped {
        tracing::warn!(run_id = %orphan.run.id, "reaped orphaned run");
    }
    Ok(reaped.into_iter().map(|o| o.run).collect())
}

fn kind_label(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Plan { .. } => "planner",
        AgentKind::Work { .. } => "worker",
    }
}

/// Best-effort extraction of `TOKEN_USAGE: <int>` from the log tail (§6, §9
/// open question: format is implementation choice, absence tolerated).
fn extract_token_usage(log_path: &std::path::Path) -> Option<i64> {
    let content = std::fs::read_to_string(log_path).ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| line.split_once("TOKEN_USAGE:").map(|(_, n)| n.trim()))
        .and_then(|n| n.parse().ok())
}

/// Best-effort extraction of `TRACKER_EPIC: <id>` from the log tail (§4.I.5:
/// "set `task.tracker_epic_id` if newly discovered"). The tracker CLI has no
/// "what epic did I just create" query, so a Planner reports it the same way
/// it reports token usage: a marker line in its own output.
fn extract_tracker_epic_id(log_path: &std::path::Path) -> Option<String> {
    let content = std::fs::read_to_string(log_path).ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| line.split_once("TRACKER_EPIC:").map(|(_, id)| id.trim().to_string()))
}

fn truncate_for_storage(message: &str) -> String {
    const MAX_LEN: usize = 2048;
    if message.len() <= MAX_LEN {
        message.to_string()
    } else {
        format!("{}…", &message[..MAX_LEN])
    }
}

#[derive(serde::Serialize)]
struct StartedPayload {
    run_id: Uuid,
    kind: &'static str,
}

#[derive(serde::Serialize)]
struct CompletedPayload {
    run_id: Uuid,
}

#[derive(serde::Serialize)]
struct LogPayload {
    run_id: Uuid,
    line_number: u64,
    text: String,
    continuation: bool,
}

#[derive(serde::Serialize)]
struct FailedPayload {
    will_retry: bool,
    next_attempt_at_secs: Option<u64>,
}

#[derive(serde::Serialize)]
struct StatusChangedPayload {
    id: Uuid,
    from: String,
    to: String,
}

#[derive(serde::Serialize)]
struct UnblockedPayload {
    subtask_id: Uuid,
    unblocked_by_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_storage_leaves_short_messages_untouched() {
        assert_eq!(truncate_for_storage("boom"), "boom");
    }

    #[test]
    fn truncate_for_storage_caps_long_messages() {
        let long = "x".repeat(3000);
        let truncated = truncate_for_storage(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn extract_token_usage_reads_last_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run-001.log");
        std::fs::write(&log_path, "[00:00:01] hello\n[00:00:02] TOKEN_USAGE: 1234\n").unwrap();
        assert_eq!(extract_token_usage(&log_path), Some(1234));
    }

    #[test]
    fn extract_token_usage_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run-001.log");
        std::fs::write(&log_path, "[00:00:01] hello\n").unwrap();
        assert_eq!(extract_token_usage(&log_path), None);
    }

    #[test]
    fn extract_tracker_epic_id_reads_last_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run-001.log");
        std::fs::write(&log_path, "[00:00:01] creating epic\n[00:00:02] TRACKER_EPIC: EPIC-42\n").unwrap();
        assert_eq!(extract_tracker_epic_id(&log_path), Some("EPIC-42".to_string()));
    }

    #[test]
    fn extract_tracker_epic_id_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run-001.log");
        std::fs::write(&log_path, "[00:00:01] hello\n").unwrap();
        assert_eq!(extract_tracker_epic_id(&log_path), None);
    }

    #[test]
    fn kind_label_matches_agent_type() {
        assert_eq!(kind_label(AgentKind::Plan { task_id: Uuid::new_v4() }), "planner");
        assert_eq!(kind_label(AgentKind::Work { subtask_id: Uuid::new_v4() }), "worker");
    }
}
