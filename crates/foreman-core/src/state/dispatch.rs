//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`] and
//! [`super::SubtaskStateMachine`] transitions with semantic names.
//!
//! Each helper takes a single `&mut PgConnection` rather than a generic
//! executor, matching the state machines they wrap — see
//! [`super::TaskStateMachine::transition`] for why. Callers not already
//! inside a transaction acquire one from the pool first.

use foreman_db::models::{BlockedReason, SubtaskStatus, TaskStatus};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::CoreResult;

use super::{SubtaskStateMachine, TaskStateMachine};

/// Mark a task's planning attempt as having produced a usable plan:
/// `planning -> active`.
pub async fn activate_task(conn: &mut PgConnection, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(conn, task_id, TaskStatus::Planning, TaskStatus::Active).await
}

/// Mark a task's planning attempt as exhausted: `planning -> planning_failed`.
pub async fn fail_planning(conn: &mut PgConnection, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(conn, task_id, TaskStatus::Planning, TaskStatus::PlanningFailed)
        .await
}

/// User-initiated retry of a failed planning attempt: `planning_failed -> planning`.
pub async fn retry_planning(conn: &mut PgConnection, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(conn, task_id, TaskStatus::PlanningFailed, TaskStatus::Planning)
        .await
}

/// Mark a new subtask `PENDING -> READY` (no dependencies).
pub async fn mark_ready(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Pending,
        SubtaskStatus::Ready,
        None,
    )
    .await
}

/// Mark a new subtask `PENDING -> BLOCKED(DEPENDENCY)` (has ≥1 dependency).
pub async fn mark_blocked_on_dependency(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Pending,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Dependency),
    )
    .await
}

/// Unblock a subtask whose dependencies have all merged: `BLOCKED(DEPENDENCY) -> READY`.
pub async fn unblock_dependency(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Blocked,
        SubtaskStatus::Ready,
        None,
    )
    .await
}

/// Start a Worker attempt: `READY -> IN_PROGRESS`.
pub async fn start_work(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Ready,
        SubtaskStatus::InProgress,
        None,
    )
    .await
}

/// Retry a failed Worker attempt: `BLOCKED(FAILURE) -> IN_PROGRESS`.
pub async fn retry_work(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Blocked,
        SubtaskStatus::InProgress,
        None,
    )
    .await
}

/// Mark a Worker attempt successful: `IN_PROGRESS -> COMPLETED`.
pub async fn complete_work(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::InProgress,
        SubtaskStatus::Completed,
        None,
    )
    .await
}

/// Exhaust retries on a Worker attempt: `IN_PROGRESS -> BLOCKED(FAILURE)`.
pub async fn block_on_failure(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::InProgress,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Failure),
    )
    .await
}

/// Mark a subtask merged after its PR lands: `COMPLETED -> MERGED`.
pub async fn mark_merged(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<()> {
    SubtaskStateMachine::transition(
        conn,
        subtask_id,
        SubtaskStatus::Completed,
        SubtaskStatus::Merged,
        None,
    )
    .await
}
