//! Database query functions for the `subtasks` table.
//!
//! Subtasks are the unit a Worker agent implements in its own worktree.
//! See [`crate::models::SubtaskStatus`] for the transition graph.
//!
//! Every function here takes its executor generically (`E: sqlx::Executor`)
//! so callers can pass a `&PgPool` for a one-off query or a `&mut
//! PgConnection` borrowed from an open transaction.

use anyhow::{Context, Result};
use sqlx::Executor;
use sqlx::Postgres;
use uuid::Uuid;

use crate::models::{BlockedReason, Subtask, SubtaskStatus};

/// The sort-key gap used when appending a new subtask to a task. Using a
/// gapped increment rather than `position + 1` leaves room for the Resolver
/// to splice subtasks between existing ones without a renumbering pass.
const POSITION_GAP: f64 = 1024.0;

/// Compute the next `position` value for a subtask appended to a task.
pub async fn next_position<'c, E>(db: E, task_id: Uuid) -> Result<f64>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (Option<f64>,) =
        sqlx::query_as("SELECT MAX(position) FROM subtasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(db)
            .await
            .context("failed to compute next position")?;

    Ok(row.0.unwrap_or(0.0) + POSITION_GAP)
}

/// Insert a new subtask. Callers are responsible for setting the initial
/// `status`/`blocked_reason` via [`crate::models::SubtaskStatus`] per
/// Invariant I1, typically through the Dependency Resolver's
/// `compute_initial` pass rather than directly.
#[allow(clippy::too_many_arguments)]
pub async fn insert_subtask<'c, E>(
    db: E,
    task_id: Uuid,
    title: &str,
    spec: Option<&str>,
    plan: Option<&str>,
    status: SubtaskStatus,
    blocked_reason: Option<BlockedReason>,
    position: f64,
    tracker_issue_id: Option<&str>,
) -> Result<Subtask>
where
    E: Executor<'c, Database = Postgres>,
{
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks \
            (task_id, title, spec, plan, status, blocked_reason, position, tracker_issue_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(title)
    .bind(spec)
    .bind(plan)
    .bind(status)
    .bind(blocked_reason)
    .bind(position)
    .bind(tracker_issue_id)
    .fetch_one(db)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask<'c, E>(db: E, id: Uuid) -> Result<Option<Subtask>>
where
    E: Executor<'c, Database = Postgres>,
{
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// List all subtasks for a task, ordered by `position`.
pub async fn list_subtasks_for_task<'c, E>(db: E, task_id: Uuid) -> Result<Vec<Subtask>>
where
    E: Executor<'c, Database = Postgres>,
{
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY position ASC",
    )
    .bind(task_id)
    .fetch_all(db)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// Find a subtask in a task by its tracker issue id, if one exists locally.
pub async fn find_by_tracker_issue_id<'c, E>(
    db: E,
    task_id: Uuid,
    tracker_issue_id: &str,
) -> Result<Option<Subtask>>
where
    E: Executor<'c, Database = Postgres>,
{
    let subtask = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 AND tracker_issue_id = $2",
    )
    .bind(task_id)
    .bind(tracker_issue_id)
    .fetch_optional(db)
    .await
    .context("failed to look up subtask by tracker issue id")?;

    Ok(subtask)
}

/// Count dependencies of `subtask_id` that are not yet `MERGED`.
///
/// Used by the Dependency Resolver ([`4.E`]) to decide whether a
/// `BLOCKED(DEPENDENCY)` subtask is eligible to become `READY`.
pub async fn count_unmerged_dependencies<'c, E>(db: E, subtask_id: Uuid) -> Result<i64>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM subtask_dependencies sd \
         JOIN subtasks dep ON dep.id = sd.depends_on_id \
         WHERE sd.subtask_id = $1 AND dep.status != 'merged'",
    )
    .bind(subtask_id)
    .fetch_one(db)
    .await
    .context("failed to count unmerged dependencies")?;

    Ok(row.0)
}

/// List the ids of subtasks that directly depend on `subtask_id`.
pub async fn list_dependents<'c, E>(db: E, subtask_id: Uuid) -> Result<Vec<Uuid>>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT subtask_id FROM subtask_dependencies WHERE depends_on_id = $1")
            .bind(subtask_id)
            .fetch_all(db)
            .await
            .context("failed to list dependents")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// List dependents of `subtask_id` that are currently `BLOCKED(DEPENDENCY)`
/// and have zero remaining unmerged dependencies — i.e. candidates for the
/// `OnMerged` unblock pass.
pub async fn list_unblocked_dependents<'c, E>(db: E, subtask_id: Uuid) -> Result<Vec<Subtask>>
where
    E: Executor<'c, Database = Postgres>,
{
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT s.* FROM subtasks s \
         JOIN subtask_dependencies sd ON sd.subtask_id = s.id \
         WHERE sd.depends_on_id = $1 \
           AND s.status = 'blocked' \
           AND s.blocked_reason = 'dependency' \
           AND NOT EXISTS ( \
               SELECT 1 FROM subtask_dependencies sd2 \
               JOIN subtasks dep2 ON dep2.id = sd2.depends_on_id \
               WHERE sd2.subtask_id = s.id AND dep2.status != 'merged' \
           )",
    )
    .bind(subtask_id)
    .fetch_all(db)
    .await
    .context("failed to list unblocked dependents")?;

    Ok(subtasks)
}

/// Atomically transition a subtask's status with optimistic locking,
/// optionally setting `blocked_reason` (I1).
pub async fn transition_subtask_status<'c, E>(
    db: E,
    subtask_id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
    blocked_reason: Option<BlockedReason>,
) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE subtasks SET status = $1, blocked_reason = $2 \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(blocked_reason)
    .bind(subtask_id)
    .bind(from)
    .execute(db)
    .await
    .context("failed to transition subtask status")?;

    Ok(result.rows_affected())
}

/// Record a completed Worker run: set `branch_name`, `pr_url`, `pr_number`
/// and transition to `COMPLETED` (I4), all in one statement so the PR
/// fields and status change atomically.
pub async fn mark_completed_with_pr<'c, E>(
    db: E,
    subtask_id: Uuid,
    branch_name: &str,
    pr_url: &str,
    pr_number: i32,
) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'completed', branch_name = $1, pr_url = $2, pr_number = $3 \
         WHERE id = $4 AND status = 'in_progress'",
    )
    .bind(branch_name)
    .bind(pr_url)
    .bind(pr_number)
    .bind(subtask_id)
    .execute(db)
    .await
    .context("failed to mark subtask completed")?;

    Ok(result.rows_affected())
}

/// Increment `retry_count` for a subtask. Returns the new value.
pub async fn increment_retry_count<'c, E>(db: E, subtask_id: Uuid) -> Result<i32>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (i32,) = sqlx::query_as(
        "UPDATE subtasks SET retry_count = retry_count + 1 WHERE id = $1 RETURNING retry_count",
    )
    .bind(subtask_id)
    .fetch_one(db)
    .await
    .context("failed to increment retry count")?;

    Ok(row.0)
}

/// Add to a subtask's cumulative `token_usage`.
pub async fn add_token_usage<'c, E>(db: E, subtask_id: Uuid, tokens: i64) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE subtasks SET token_usage = token_usage + $1 WHERE id = $2")
        .bind(tokens)
        .bind(subtask_id)
        .execute(db)
        .await
        .context("failed to add token usage")?;

    Ok(())
}

/// Set the worktree path and branch name assigned to a subtask, provisioned
/// by the Worktree Manager ahead of a Worker run.
pub async fn set_worktree_path<'c, E>(
    db: E,
    subtask_id: Uuid,
    path: &str,
    branch_name: &str,
) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE subtasks SET worktree_path = $1, branch_name = $2 WHERE id = $3")
        .bind(path)
        .bind(branch_name)
        .bind(subtask_id)
        .execute(db)
        .await
        .context("failed to set worktree path")?;

    Ok(())
}

/// Clear the worktree path once it has been reclaimed.
pub async fn clear_worktree_path<'c, E>(db: E, subtask_id: Uuid) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE subtasks SET worktree_path = NULL WHERE id = $1")
        .bind(subtask_id)
        .execute(db)
        .await
        .context("failed to clear worktree path")?;

    Ok(())
}

/// Remove subtasks by id. Used by External Sync to prune subtasks the
/// tracker no longer reports, restricted by the caller to ids that have
/// never reached `IN_PROGRESS` or later (§4.G).
pub async fn delete_subtasks<'c, E>(db: E, ids: &[Uuid]) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("DELETE FROM subtasks WHERE id = ANY($1)")
        .bind(ids)
        .execute(db)
        .await
        .context("failed to delete subtasks")?;

    Ok(result.rows_affected())
}
