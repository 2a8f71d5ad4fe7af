//! Database query functions for the `agent_runs` table.
//!
//! Exactly one of `task_id` (Planner) or `subtask_id` (Worker) is set per
//! row (I3, I5). A partial unique index on each parent enforces "at most
//! one RUNNING run" at the database level; callers should still treat a
//! unique-violation on insert as an ordinary error, not panic on it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentRun, AgentType};

/// Compute the next `attempt_number` for a Planner run bound to `task_id`.
pub async fn next_attempt_number_for_task(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (Option<i32>,) =
        sqlx::query_as("SELECT MAX(attempt_number) FROM agent_runs WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to compute next attempt number for task")?;

    Ok(row.0.unwrap_or(0) + 1)
}

/// Compute the next `attempt_number` for a Worker run bound to `subtask_id`.
pub async fn next_attempt_number_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<i32> {
    let row: (Option<i32>,) =
        sqlx::query_as("SELECT MAX(attempt_number) FROM agent_runs WHERE subtask_id = $1")
            .bind(subtask_id)
            .fetch_one(pool)
            .await
            .context("failed to compute next attempt number for subtask")?;

    Ok(row.0.unwrap_or(0) + 1)
}

/// Insert a new `RUNNING` Planner run.
pub async fn insert_planner_run(
    pool: &PgPool,
    task_id: Uuid,
    attempt_number: i32,
    log_path: &str,
    prompt_text: &str,
) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs \
            (task_id, subtask_id, agent_type, attempt_number, status, log_path, prompt_text) \
         VALUES ($1, NULL, 'planner', $2, 'running', $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(attempt_number)
    .bind(log_path)
    .bind(prompt_text)
    .fetch_one(pool)
    .await
    .context("failed to insert planner run")?;

    Ok(run)
}

/// Insert a new `RUNNING` Worker run.
pub async fn insert_worker_run(
    pool: &PgPool,
    subtask_id: Uuid,
    attempt_number: i32,
    log_path: &str,
    prompt_text: &str,
) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs \
            (task_id, subtask_id, agent_type, attempt_number, status, log_path, prompt_text) \
         VALUES (NULL, $1, 'worker', $2, 'running', $3, $4) \
         RETURNING *",
    )
    .bind(subtask_id)
    .bind(attempt_number)
    .bind(log_path)
    .bind(prompt_text)
    .fetch_one(pool)
    .await
    .context("failed to insert worker run")?;

    Ok(run)
}

/// Fetch a single run by its own id.
pub async fn get_run(pool: &PgPool, run_id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>("SELECT * FROM agent_runs WHERE id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// Fetch the currently `RUNNING` run for a task (Planner), if any.
pub async fn get_running_run_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE task_id = $1 AND agent_type = 'planner' AND status = 'running'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch running planner run")?;

    Ok(run)
}

/// Fetch the currently `RUNNING` run for a subtask (Worker), if any.
pub async fn get_running_run_for_subtask(
    pool: &PgPool,
    subtask_id: Uuid,
) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE subtask_id = $1 AND agent_type = 'worker' AND status = 'running'",
    )
    .bind(subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch running worker run")?;

    Ok(run)
}

/// Mark a run `SUCCEEDED`, recording `ended_at` and best-effort `token_usage`.
pub async fn complete_run_succeeded(
    pool: &PgPool,
    run_id: Uuid,
    token_usage: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE agent_runs \
         SET status = 'succeeded', ended_at = now(), token_usage = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(token_usage)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to mark run succeeded")?;

    Ok(())
}

/// Mark a run `FAILED`, recording `ended_at` and `error_message`.
pub async fn complete_run_failed(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE agent_runs \
         SET status = 'failed', ended_at = now(), error_message = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to mark run failed")?;

    Ok(())
}

/// List all runs for a subtask, most recent attempt first.
pub async fn list_runs_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE subtask_id = $1 ORDER BY attempt_number DESC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for subtask")?;

    Ok(runs)
}

/// List all runs for a task, most recent attempt first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE task_id = $1 ORDER BY attempt_number DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for task")?;

    Ok(runs)
}

/// A run reaped by orphan recovery, tagged with its agent type and parent
/// for the caller to decide whether to reschedule or escalate.
#[derive(Debug, Clone)]
pub struct OrphanedRun {
    pub run: AgentRun,
}

/// Mark every `RUNNING` run started before `older_than` as `FAILED` with
/// `error_message = "orphaned by restart"` (§4.I orphan recovery). Returns
/// the reaped rows so the caller can decide on rescheduling.
pub async fn mark_stale_runs_failed(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<Vec<OrphanedRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "UPDATE agent_runs \
         SET status = 'failed', ended_at = now(), error_message = 'orphaned by restart' \
         WHERE status = 'running' AND started_at < $1 \
         RETURNING *",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to mark stale runs failed")?;

    Ok(runs.into_iter().map(|run| OrphanedRun { run }).collect())
}

/// Whether the given `agent_type` already has a `RUNNING` row for the
/// relevant parent, checked just before insert to surface a clear error
/// rather than relying solely on the database's unique index (I3).
pub async fn has_running_run(
    pool: &PgPool,
    agent_type: AgentType,
    task_id: Option<Uuid>,
    subtask_id: Option<Uuid>,
) -> Result<bool> {
    match agent_type {
        AgentType::Planner => {
            let task_id = task_id.context("planner run requires task_id")?;
            Ok(get_running_run_for_task(pool, task_id).await?.is_some())
        }
        AgentType::Worker => {
            let subtask_id = subtask_id.context("worker run requires subtask_id")?;
            Ok(get_running_run_for_subtask(pool, subtask_id)
                .await?
                .is_some())
        }
    }
}
