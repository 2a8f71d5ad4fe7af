//! `foreman task` subcommands: submit a Task and let a Planner attempt run
//! against it, or inspect existing Tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_core::agent::AgentKind;
use foreman_core::config::ServiceConfig;
use foreman_db::queries::tasks as tasks_db;

use crate::runner_ctx;

/// Create a task and immediately run one Planner attempt in the foreground.
pub async fn run_add(
    pool: PgPool,
    config: ServiceConfig,
    project_id: Uuid,
    title: &str,
    description: &str,
    agent_command: String,
    agent_args: Vec<String>,
) -> Result<()> {
    let task = tasks_db::insert_task(&pool, project_id, title, description).await?;
    println!("Task {} created (status={}).", task.id, task.status);

    let ctx = runner_ctx::build(pool, config, project_id, agent_command, agent_args).await?;
    let outcome = ctx
        .runner
        .run_attempt(AgentKind::Plan { task_id: task.id }, CancellationToken::new())
        .await
        .context("running planner attempt")?;

    println!("Planner attempt finished: {outcome:?}");
    Ok(())
}

pub async fn run_list(pool: &PgPool, project_id: Uuid) -> Result<()> {
    let tasks = tasks_db::list_tasks_for_project(pool, project_id).await?;
    if tasks.is_empty() {
        println!("No tasks found for project {project_id}.");
        return Ok(());
    }
    for task in tasks {
        println!("{}  [{}]  {}", task.id, task.status, task.title);
    }
    Ok(())
}

pub async fn run_show(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;
    let task = tasks_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))?;

    println!("Task: {}", task.id);
    println!("  title           = {}", task.title);
    println!("  status          = {}", task.status);
    println!("  tracker_epic_id = {}", task.tracker_epic_id.as_deref().unwrap_or("(none)"));
    println!("  created_at      = {}", task.created_at);
    println!();
    println!("Description:");
    println!("{}", task.description);

    Ok(())
}
