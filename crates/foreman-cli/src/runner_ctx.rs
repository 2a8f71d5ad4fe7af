//! Assembles an [`AgentRunner`] for a project: the one place the CLI wires
//! together the Event Hub, Tracker CLI client, and Worktree Manager that
//! every agent-invoking command needs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_core::agent::AgentRunner;
use foreman_core::config::ServiceConfig;
use foreman_core::event_hub::EventHub;
use foreman_core::tracker::TrackerClient;
use foreman_core::worktree::WorktreeManager;
use foreman_db::queries::projects as projects_db;

/// Everything the CLI needs to run agent attempts and, separately, drive
/// the background reconciler for the same project.
pub struct RunnerContext {
    pub runner: AgentRunner,
    pub event_hub: EventHub,
    pub tracker: TrackerClient,
    pub repo_path: PathBuf,
}

pub async fn build(
    pool: PgPool,
    config: ServiceConfig,
    project_id: Uuid,
    agent_command: String,
    agent_args: Vec<String>,
) -> Result<RunnerContext> {
    let project = projects_db::get_project(&pool, project_id)
        .await?
        .with_context(|| format!("project {project_id} not found"))?;

    let event_hub = EventHub::new(
        config.event_hub.channel_buffer,
        config.event_hub.max_connections_per_user,
        config.event_hub.heartbeat_interval,
    );

    let tracker = TrackerClient::new(config.sync.tracker_cli_path.clone());
    tracker.verify_available().context("tracker CLI is not available")?;

    let worktree = WorktreeManager::for_project(&project, config.worktree.base_dir_override.clone())
        .context("opening worktree manager for project")?;
    let repo_path = worktree.repo_path().to_path_buf();

    let runner = AgentRunner::new(
        pool,
        config,
        event_hub.clone(),
        tracker.clone(),
        worktree,
        project,
        agent_command,
        agent_args,
    );

    Ok(RunnerContext { runner, event_hub, tracker, repo_path })
}
