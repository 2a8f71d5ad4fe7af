//! Database query functions for the `tasks` table.
//!
//! A Task is the top-level unit a user submits; a Planner agent decomposes
//! it into Subtasks. See [`crate::models::TaskStatus`] for the transition
//! graph enforced by `foreman-core`'s state machine.
//!
//! Every function here takes its executor generically (`E: sqlx::Executor`)
//! so callers can pass a `&PgPool` for a one-off query or a `&mut
//! PgConnection` borrowed from an open transaction — see
//! `foreman-core::sync::sync_task` for the latter.

use anyhow::{Context, Result};
use sqlx::Executor;
use sqlx::Postgres;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row in `planning` status.
pub async fn insert_task<'c, E>(
    db: E,
    project_id: Uuid,
    title: &str,
    description: &str,
) -> Result<Task>
where
    E: Executor<'c, Database = Postgres>,
{
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (project_id, title, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(title)
    .bind(description)
    .fetch_one(db)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task<'c, E>(db: E, id: Uuid) -> Result<Option<Task>>
where
    E: Executor<'c, Database = Postgres>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, ordered by creation time.
pub async fn list_tasks_for_project<'c, E>(db: E, project_id: Uuid) -> Result<Vec<Task>>
where
    E: Executor<'c, Database = Postgres>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(db)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Atomically transition a task's status with optimistic locking.
///
/// The UPDATE's WHERE clause includes `status = $from`, so the row is only
/// updated if the current status matches. Returns the number of rows
/// affected (0 means the status did not match or the task does not exist).
pub async fn transition_task_status<'c, E>(
    db: E,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(task_id)
        .bind(from)
        .execute(db)
        .await
        .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Record the tracker-issued epic id for a task the first time a Planner
/// discovers one. Idempotent: only writes when currently unset.
pub async fn set_tracker_epic_id<'c, E>(db: E, task_id: Uuid, epic_id: &str) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE tasks SET tracker_epic_id = $1 WHERE id = $2 AND tracker_epic_id IS NULL")
        .bind(epic_id)
        .bind(task_id)
        .execute(db)
        .await
        .context("failed to set tracker epic id")?;

    Ok(())
}

/// Check Invariant I7: a task is `DONE` iff it has at least one subtask and
/// every subtask is `MERGED`. Used by the Agent Loop after a merge-triggered
/// unblock pass to decide whether to transition the parent task.
pub async fn all_subtasks_merged<'c, E>(db: E, task_id: Uuid) -> Result<bool>
where
    E: Executor<'c, Database = Postgres>,
{
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE status = 'merged') \
         FROM subtasks WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(db)
    .await
    .context("failed to check subtask merge completion")?;

    let (total, merged) = row;
    Ok(total > 0 && total == merged)
}
