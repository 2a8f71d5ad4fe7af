//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Project;

/// Insert a new project row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_project(
    pool: &PgPool,
    user_id: Uuid,
    owner_repo: &str,
    default_branch: &str,
    clone_path: &str,
    tracker_prefix: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (user_id, owner_repo, default_branch, clone_path, tracker_prefix) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(user_id)
    .bind(owner_repo)
    .bind(default_branch)
    .bind(clone_path)
    .bind(tracker_prefix)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects owned by a user.
pub async fn list_projects_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects for user")?;

    Ok(projects)
}

/// Delete a project. Cascades to tasks, subtasks, dependencies, and agent
/// runs via foreign-key `ON DELETE CASCADE`.
pub async fn delete_project(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM projects WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete project")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("project {id} not found");
    }

    Ok(())
}
