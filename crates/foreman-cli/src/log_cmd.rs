//! `foreman log` command: print an AgentRun's captured log file.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::queries::agent_runs as runs_db;

pub async fn run_log(pool: &PgPool, run_id_str: &str) -> Result<()> {
    let run_id =
        Uuid::parse_str(run_id_str).with_context(|| format!("invalid run ID: {run_id_str}"))?;

    let run = runs_db::get_run(pool, run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;

    println!(
        "Run {}  attempt={}  status={}  log={}",
        run.id, run.attempt_number, run.status, run.log_path
    );
    if let Some(error) = &run.error_message {
        println!("error: {error}");
    }
    println!();

    let contents = std::fs::read_to_string(&run.log_path)
        .with_context(|| format!("failed to read log file at {}", run.log_path))?;
    print!("{contents}");

    Ok(())
}
