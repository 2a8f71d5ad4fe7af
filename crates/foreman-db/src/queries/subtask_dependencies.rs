//! Database query functions for the `subtask_dependencies` table.
//!
//! Edges are directed: `subtask_id` depends on `depends_on_id`. The graph
//! within a task must be a DAG (I6); cycle detection happens in
//! `foreman-core`'s Dependency Resolver before edges are written here.
//!
//! Every function here takes its executor generically (`E: sqlx::Executor`)
//! so callers can pass a `&PgPool` for a one-off query or a `&mut
//! PgConnection` borrowed from an open transaction.

use anyhow::{Context, Result};
use sqlx::Executor;
use sqlx::Postgres;
use uuid::Uuid;

use crate::models::SubtaskDependency;

/// Insert a dependency edge. Idempotent via `ON CONFLICT DO NOTHING`.
pub async fn insert_dependency<'c, E>(db: E, subtask_id: Uuid, depends_on_id: Uuid) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO subtask_dependencies (subtask_id, depends_on_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(subtask_id)
    .bind(depends_on_id)
    .execute(db)
    .await
    .context("failed to insert subtask dependency")?;

    Ok(())
}

/// List all dependency edges for a task (joins through `subtasks`).
pub async fn list_dependencies_for_task<'c, E>(
    db: E,
    task_id: Uuid,
) -> Result<Vec<SubtaskDependency>>
where
    E: Executor<'c, Database = Postgres>,
{
    let edges = sqlx::query_as::<_, SubtaskDependency>(
        "SELECT sd.subtask_id, sd.depends_on_id FROM subtask_dependencies sd \
         JOIN subtasks s ON s.id = sd.subtask_id \
         WHERE s.task_id = $1",
    )
    .bind(task_id)
    .fetch_all(db)
    .await
    .context("failed to list dependencies for task")?;

    Ok(edges)
}

/// List the direct dependency ids of a subtask.
pub async fn list_dependency_ids<'c, E>(db: E, subtask_id: Uuid) -> Result<Vec<Uuid>>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on_id FROM subtask_dependencies WHERE subtask_id = $1")
            .bind(subtask_id)
            .fetch_all(db)
            .await
            .context("failed to list dependency ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Remove every dependency edge touching the given subtask ids, in either
/// direction. Used by External Sync before re-writing tracker-declared
/// edges for a task.
pub async fn delete_edges_touching<'c, E>(db: E, subtask_ids: &[Uuid]) -> Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    if subtask_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "DELETE FROM subtask_dependencies \
         WHERE subtask_id = ANY($1) OR depends_on_id = ANY($1)",
    )
    .bind(subtask_ids)
    .execute(db)
    .await
    .context("failed to delete dependency edges")?;

    Ok(())
}
