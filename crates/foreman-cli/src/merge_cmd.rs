//! `foreman merge` command: record that a subtask's PR has landed.
//!
//! GitHub merges happen outside the orchestration core (a human clicks
//! "merge" or CI auto-merges); this command is how the operator tells
//! foreman about it so the Dependency Resolver can unblock dependents.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_core::config::ServiceConfig;

use crate::runner_ctx;

pub async fn run_merge(
    pool: PgPool,
    config: ServiceConfig,
    project_id: Uuid,
    subtask_id: Uuid,
    agent_command: String,
    agent_args: Vec<String>,
) -> Result<()> {
    let ctx = runner_ctx::build(pool, config, project_id, agent_command, agent_args).await?;
    ctx.runner.record_merge(subtask_id).await?;
    println!("Subtask {subtask_id} marked merged.");
    Ok(())
}
