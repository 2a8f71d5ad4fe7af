//! `foreman run` command: the long-lived dispatch loop for a project.
//!
//! On startup, reaps runs orphaned by a previous crash, then drives three
//! concurrent tasks until Ctrl+C: the External Sync background reconciler,
//! an Event Hub subscriber that prints every event as newline-delimited
//! JSON to stdout (§6's documented event stream format), and a polling
//! loop that starts Planner attempts for `PLANNING` Tasks and Worker
//! attempts for `READY` Subtasks with no run already in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_core::agent::{AgentKind, AgentRunner};
use foreman_core::config::ServiceConfig;
use foreman_core::event_hub::{EventHub, LogSubscription};
use foreman_core::state::dispatch;
use foreman_core::{agent, sync};
use foreman_db::models::{AgentType, SubtaskStatus, TaskStatus};
use foreman_db::queries::{agent_runs as runs_db, subtasks as subtasks_db, tasks as tasks_db};

use crate::runner_ctx;

/// How often the dispatch loop polls for newly-dispatchable work.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on how long in-flight attempts get to wind down after a
/// shutdown signal before the process exits anyway (§5).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

pub async fn run(
    pool: PgPool,
    config: ServiceConfig,
    project_id: Uuid,
    agent_command: String,
    agent_args: Vec<String>,
) -> Result<()> {
    let orphan_grace_window = config.agent_loop.orphan_grace_window;
    let reaped = agent::reap_orphaned_runs(&pool, orphan_grace_window).await?;
    if !reaped.is_empty() {
        println!("Reaped {} orphaned run(s).", reaped.len());
    }

    let sync_interval = config.sync.interval;
    let ctx = runner_ctx::build(pool.clone(), config, project_id, agent_command, agent_args).await?;
    let runner = Arc::new(ctx.runner);

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        eprintln!("\nShutting down (draining in-flight attempts, up to {}s)...", SHUTDOWN_DEADLINE.as_secs());
        cancel_for_signal.cancel();
    });

    let reconciler = tokio::spawn(sync::run_reconciler(
        pool.clone(),
        ctx.tracker,
        ctx.repo_path,
        project_id,
        sync_interval,
        cancel.clone(),
    ));

    let events = tokio::spawn(print_events(ctx.event_hub, project_id, cancel.clone()));

    let dispatch_loop = dispatch_loop(pool, runner.clone(), project_id, cancel.clone());

    dispatch_loop.await?;
    cancel.cancel();

    let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        let _ = reconciler.await;
        let _ = events.await;
    })
    .await;

    println!("Stopped.");
    Ok(())
}

/// Drains the Event Hub and prints each event as one NDJSON line per §6.
async fn print_events(event_hub: EventHub, project_id: Uuid, cancel: CancellationToken) {
    let user_id = Uuid::nil();
    let (connection_id, mut rx) = match event_hub.subscribe(project_id, user_id, LogSubscription::All).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "failed to subscribe to event hub");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                    }
                    None => break,
                }
            }
        }
    }

    event_hub.unsubscribe(project_id, connection_id).await;
}

/// Polls for dispatchable Tasks and Subtasks, starting one attempt each as
/// a background task. Runs until `cancel` fires, then returns once no
/// newly-started attempt remains to spawn (in-flight attempts continue
/// independently and are drained by the caller's shutdown timeout).
async fn dispatch_loop(pool: PgPool, runner: Arc<AgentRunner>, project_id: Uuid, cancel: CancellationToken) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        if let Err(e) = dispatch_tick(&pool, &runner, project_id, &cancel).await {
            tracing::warn!(error = %e, "dispatch tick failed");
        }
    }
}

async fn dispatch_tick(pool: &PgPool, runner: &Arc<AgentRunner>, project_id: Uuid, cancel: &CancellationToken) -> Result<()> {
    let tasks = tasks_db::list_tasks_for_project(pool, project_id)
        .await
        .context("listing tasks for dispatch")?;

    for task in tasks.iter().filter(|t| t.status == TaskStatus::Planning) {
        if runs_db::has_running_run(pool, AgentType::Planner, Some(task.id), None).await? {
            continue;
        }
        spawn_attempt(runner.clone(), AgentKind::Plan { task_id: task.id }, cancel.clone());
    }

    for task in &tasks {
        let subtasks = subtasks_db::list_subtasks_for_task(pool, task.id)
            .await
            .context("listing subtasks for dispatch")?;

        for subtask in subtasks.into_iter().filter(|s| s.status == SubtaskStatus::Ready) {
            if runs_db::has_running_run(pool, AgentType::Worker, None, Some(subtask.id)).await? {
                continue;
            }
            let mut conn = pool.acquire().await.context("acquiring connection")?;
            dispatch::start_work(&mut conn, subtask.id).await.context("starting subtask work")?;
            drop(conn);
            spawn_attempt(runner.clone(), AgentKind::Work { subtask_id: subtask.id }, cancel.clone());
        }
    }

    Ok(())
}

fn spawn_attempt(runner: Arc<AgentRunner>, kind: AgentKind, cancel: CancellationToken) {
    tokio::spawn(async move {
        match runner.run_attempt(kind, cancel).await {
            Ok(outcome) => tracing::info!(?kind, ?outcome, "attempt finished"),
            Err(e) => tracing::warn!(?kind, error = %e, "attempt failed"),
        }
    });
}
