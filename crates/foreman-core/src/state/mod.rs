//! Task and Subtask state machines.
//!
//! Validates and executes state transitions, enforcing the allowed
//! transition graph, optimistic locking, and Invariant I1 (`blocked_reason`
//! is set iff `status = BLOCKED`). Every transition is attempted through
//! [`TaskStateMachine`]/[`SubtaskStateMachine`] rather than writing
//! `status` columns directly, so the graph in SPEC_FULL.md §4.F is the only
//! place transitions can happen.

pub mod dispatch;

use foreman_db::models::{BlockedReason, SubtaskStatus, TaskStatus};
use foreman_db::queries::{subtasks as subtasks_db, tasks as tasks_db};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// The Task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// planning         -> active | planning_failed
/// planning_failed  -> planning   (user-initiated retry)
/// active           -> done
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Planning, TaskStatus::Active)
                | (TaskStatus::Planning, TaskStatus::PlanningFailed)
                | (TaskStatus::PlanningFailed, TaskStatus::Planning)
                | (TaskStatus::Active, TaskStatus::Done)
        )
    }

    /// Execute a transition with optimistic locking.
    ///
    /// Reloads the row, validates the pair, writes the new status, and
    /// returns the task's id so the caller can publish the outgoing event
    /// after commit (events must never leak before a commit succeeds).
    ///
    /// Takes a single connection rather than a generic executor because a
    /// lock-failure reload issues a second query against the same
    /// connection — callers inside a transaction pass `&mut *tx`; standalone
    /// callers pass a connection acquired from the pool.
    pub async fn transition(
        conn: &mut PgConnection,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            tracing::warn!(task_id = %task_id, from = %from, to = %to, "rejected invalid task transition");
            return Err(CoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let rows = tasks_db::transition_task_status(&mut *conn, task_id, from, to).await?;

        if rows == 0 {
            let task = tasks_db::get_task(&mut *conn, task_id).await?;
            return match task {
                None => Err(CoreError::NotFound {
                    kind: "task",
                    id: task_id,
                }),
                Some(t) => {
                    tracing::warn!(task_id = %task_id, from = %from, to = %to, actual = %t.status, "task transition lock failure");
                    Err(CoreError::Conflict {
                        message: format!(
                            "task {task_id} has status {}, expected {from}",
                            t.status
                        ),
                    })
                }
            };
        }

        tracing::info!(task_id = %task_id, from = %from, to = %to, "task transitioned");
        Ok(())
    }

    /// Transition `ACTIVE -> DONE` only if Invariant I7 holds: the task has
    /// at least one subtask and every subtask is `MERGED`.
    pub async fn complete_if_all_merged(conn: &mut PgConnection, task_id: Uuid) -> CoreResult<bool> {
        if !tasks_db::all_subtasks_merged(&mut *conn, task_id).await? {
            return Ok(false);
        }
        Self::transition(conn, task_id, TaskStatus::Active, TaskStatus::Done).await?;
        Ok(true)
    }
}

/// The Subtask state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending              -> ready | blocked(dependency)
/// blocked(dependency)  -> ready
/// ready                -> in_progress
/// in_progress          -> completed | blocked(failure)
/// completed            -> merged
/// blocked(failure)     -> in_progress   (user retry)
/// ```
pub struct SubtaskStateMachine;

impl SubtaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge,
    /// given the `blocked_reason` that would accompany `to` (only
    /// meaningful when `to = BLOCKED`).
    pub fn is_valid_transition(
        from: SubtaskStatus,
        to: SubtaskStatus,
        to_reason: Option<BlockedReason>,
    ) -> bool {
        use SubtaskStatus::*;
        match (from, to, to_reason) {
            (Pending, Ready, None) => true,
            (Pending, Blocked, Some(BlockedReason::Dependency)) => true,
            (Blocked, Ready, None) => true,
            (Ready, InProgress, None) => true,
            (InProgress, Completed, None) => true,
            (InProgress, Blocked, Some(BlockedReason::Failure)) => true,
            (Completed, Merged, None) => true,
            (Blocked, InProgress, None) => true,
            _ => false,
        }
    }

    /// Execute a transition with optimistic locking (I1 is enforced by the
    /// caller passing a matching `to_reason`, and redundantly by the
    /// database CHECK constraint).
    ///
    /// Takes a single connection for the same reason as
    /// [`TaskStateMachine::transition`]: a lock-failure reload issues a
    /// second query against it.
    pub async fn transition(
        conn: &mut PgConnection,
        subtask_id: Uuid,
        from: SubtaskStatus,
        to: SubtaskStatus,
        to_reason: Option<BlockedReason>,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to, to_reason) {
            tracing::warn!(subtask_id = %subtask_id, from = %from, to = %to, "rejected invalid subtask transition");
            return Err(CoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let rows =
            subtasks_db::transition_subtask_status(&mut *conn, subtask_id, from, to, to_reason)
                .await?;

        if rows == 0 {
            let subtask = subtasks_db::get_subtask(&mut *conn, subtask_id).await?;
            return match subtask {
                None => Err(CoreError::NotFound {
                    kind: "subtask",
                    id: subtask_id,
                }),
                Some(s) => {
                    tracing::warn!(subtask_id = %subtask_id, from = %from, to = %to, actual = %s.status, "subtask transition lock failure");
                    Err(CoreError::Conflict {
                        message: format!(
                            "subtask {subtask_id} has status {}, expected {from}",
                            s.status
                        ),
                    })
                }
            };
        }

        tracing::info!(subtask_id = %subtask_id, from = %from, to = %to, reason = ?to_reason, "subtask transitioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_transitions() {
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::Active
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::PlanningFailed
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::PlanningFailed,
            TaskStatus::Planning
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Active,
            TaskStatus::Done
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Planning,
            TaskStatus::Done
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Done,
            TaskStatus::Active
        ));
    }

    #[test]
    fn subtask_transitions() {
        use SubtaskStatus::*;
        assert!(SubtaskStateMachine::is_valid_transition(
            Pending,
            Ready,
            None
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            Pending,
            Blocked,
            Some(BlockedReason::Dependency)
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            Blocked, Ready, None
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            Ready,
            InProgress,
            None
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            InProgress, Completed, None
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            InProgress,
            Blocked,
            Some(BlockedReason::Failure)
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            Completed, Merged, None
        ));
        assert!(SubtaskStateMachine::is_valid_transition(
            Blocked, InProgress, None
        ));
    }

    #[test]
    fn subtask_invalid_transitions_rejected() {
        use SubtaskStatus::*;
        // Wrong blocked_reason for the transition (I1).
        assert!(!SubtaskStateMachine::is_valid_transition(
            Pending,
            Blocked,
            Some(BlockedReason::Failure)
        ));
        // Missing blocked_reason where one is required.
        assert!(!SubtaskStateMachine::is_valid_transition(
            Pending, Blocked, None
        ));
        // Skipping states entirely.
        assert!(!SubtaskStateMachine::is_valid_transition(
            Pending, Completed, None
        ));
        assert!(!SubtaskStateMachine::is_valid_transition(
            Merged,
            InProgress,
            None
        ));
    }
}
