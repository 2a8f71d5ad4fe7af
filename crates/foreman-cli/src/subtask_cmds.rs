//! `foreman subtask` subcommands: inspect Subtasks and manually retry one
//! that is `BLOCKED(FAILURE)`.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_core::agent::AgentKind;
use foreman_core::config::ServiceConfig;
use foreman_core::state::dispatch;
use foreman_db::queries::{agent_runs as runs_db, subtasks as subtasks_db};

use crate::runner_ctx;

pub async fn run_list(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let subtasks = subtasks_db::list_subtasks_for_task(pool, task_id).await?;
    if subtasks.is_empty() {
        println!("No subtasks found for task {task_id}.");
        return Ok(());
    }
    for subtask in subtasks {
        let pr = subtask.pr_url.as_deref().unwrap_or("-");
        println!("{}  [{}]  {}  pr={}", subtask.id, subtask.status, subtask.title, pr);
    }
    Ok(())
}

pub async fn run_show(pool: &PgPool, subtask_id_str: &str) -> Result<()> {
    let id = Uuid::parse_str(subtask_id_str)
        .with_context(|| format!("invalid subtask ID: {subtask_id_str}"))?;
    let subtask = subtasks_db::get_subtask(pool, id)
        .await?
        .with_context(|| format!("subtask {id} not found"))?;

    println!("Subtask: {}", subtask.id);
    println!("  title          = {}", subtask.title);
    println!("  status         = {}", subtask.status);
    println!("  retry_count    = {}", subtask.retry_count);
    println!("  token_usage    = {}", subtask.token_usage);
    println!("  branch_name    = {}", subtask.branch_name.as_deref().unwrap_or("(none)"));
    println!("  pr_url         = {}", subtask.pr_url.as_deref().unwrap_or("(none)"));

    let runs = runs_db::list_runs_for_subtask(pool, id).await?;
    println!();
    println!("Runs ({}):", runs.len());
    for run in runs {
        println!("  attempt {}  [{}]  {}", run.attempt_number, run.status, run.log_path);
    }

    Ok(())
}

/// Manually retry a subtask currently `BLOCKED(FAILURE)`: `BLOCKED -> IN_PROGRESS`
/// then run a fresh Worker attempt in the foreground.
pub async fn run_retry(
    pool: PgPool,
    config: ServiceConfig,
    project_id: Uuid,
    subtask_id: Uuid,
    agent_command: String,
    agent_args: Vec<String>,
) -> Result<()> {
    let mut conn = pool.acquire().await.context("acquiring connection")?;
    dispatch::retry_work(&mut conn, subtask_id)
        .await
        .context("retrying subtask")?;
    drop(conn);

    let ctx = runner_ctx::build(pool, config, project_id, agent_command, agent_args).await?;
    let outcome = ctx
        .runner
        .run_attempt(AgentKind::Work { subtask_id }, CancellationToken::new())
        .await
        .context("running worker attempt")?;

    println!("Worker attempt finished: {outcome:?}");
    Ok(())
}
