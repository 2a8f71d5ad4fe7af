//! `foreman project` subcommands: register and inspect Projects.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::queries::{projects as projects_db, users as users_db};

pub async fn run_add(
    pool: &PgPool,
    owner_repo: &str,
    default_branch: &str,
    clone_path: &str,
    tracker_prefix: &str,
) -> Result<()> {
    let user = users_db::insert_user(pool).await?;
    let project = projects_db::insert_project(
        pool,
        user.id,
        owner_repo,
        default_branch,
        clone_path,
        tracker_prefix,
    )
    .await?;

    println!("Project {} created.", project.id);
    println!("  owner/repo      = {}", project.owner_repo);
    println!("  default_branch  = {}", project.default_branch);
    println!("  clone_path      = {}", project.clone_path);
    println!("  tracker_prefix  = {}", project.tracker_prefix);

    Ok(())
}

pub async fn run_list(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let projects = projects_db::list_projects_for_user(pool, user_id).await?;
    if projects.is_empty() {
        println!("No projects found for user {user_id}.");
        return Ok(());
    }
    for project in projects {
        println!("{}  {}  ({})", project.id, project.owner_repo, project.default_branch);
    }
    Ok(())
}

pub async fn run_show(pool: &PgPool, project_id_str: &str) -> Result<()> {
    let id = Uuid::parse_str(project_id_str)
        .with_context(|| format!("invalid project ID: {project_id_str}"))?;
    let project = projects_db::get_project(pool, id)
        .await?
        .with_context(|| format!("project {id} not found"))?;

    println!("Project: {}", project.id);
    println!("  owner/repo      = {}", project.owner_repo);
    println!("  default_branch  = {}", project.default_branch);
    println!("  clone_path      = {}", project.clone_path);
    println!("  tracker_prefix  = {}", project.tracker_prefix);
    println!("  created_at      = {}", project.created_at);

    Ok(())
}
