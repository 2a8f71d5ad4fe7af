//! Dependency Resolver (§4.E).
//!
//! Decides the initial `READY`/`BLOCKED(DEPENDENCY)` status of freshly
//! materialized subtasks, and propagates unblocking when a subtask merges.
//! Cycle detection runs once, ahead of either, over a Planner's declared
//! edges before anything is written to the database.

use std::collections::{HashMap, HashSet};

use foreman_db::queries::{subtask_dependencies as deps_db, subtasks as subtasks_db};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::state::dispatch;

/// A dependency edge as declared by a Planner, before it is written to the
/// database: `subtask depends on depends_on`.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredEdge {
    pub subtask: Uuid,
    pub depends_on: Uuid,
}

/// Topologically sort `edges` over `nodes`, failing with
/// [`CoreError::PlanCycle`] if they do not form a DAG (Invariant I6).
///
/// Must run before any edge is persisted — materializing a cyclic graph
/// first and detecting it after would leave invalid state in the database.
pub fn check_acyclic(nodes: &[Uuid], edges: &[DeclaredEdge]) -> CoreResult<()> {
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut in_degree: HashMap<Uuid, usize> = nodes.iter().map(|&n| (n, 0)).collect();

    for edge in edges {
        adjacency.entry(edge.depends_on).or_default().push(edge.subtask);
        *in_degree.entry(edge.subtask).or_insert(0) += 1;
        in_degree.entry(edge.depends_on).or_insert(0);
    }

    let mut queue: Vec<Uuid> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut visited = 0usize;
    let mut remaining: HashSet<Uuid> = in_degree.keys().copied().collect();

    while let Some(node) = queue.pop() {
        remaining.remove(&node);
        visited += 1;
        if let Some(dependents) = adjacency.get(&node) {
            for &dependent in dependents {
                let deg = in_degree.get_mut(&dependent).expect("tracked in_degree");
                *deg -= 1;
                if *deg == 0 {
                    queue.push(dependent);
                }
            }
        }
    }

    if visited != in_degree.len() {
        let cycle_path = remaining
            .into_iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(CoreError::PlanCycle { cycle_path });
    }

    Ok(())
}

/// `ComputeInitial(taskID)`: for every `PENDING` subtask of `task_id`,
/// transition it to `READY` if it has no dependencies, or to
/// `BLOCKED(DEPENDENCY)` if it has at least one. Intended to run once,
/// right after a Planner's subtasks and edges have been materialized, inside
/// the same transaction as that materialization (§4.G).
pub async fn compute_initial(conn: &mut PgConnection, task_id: Uuid) -> CoreResult<()> {
    let subtasks = subtasks_db::list_subtasks_for_task(&mut *conn, task_id).await?;

    for subtask in subtasks {
        if subtask.status != foreman_db::models::SubtaskStatus::Pending {
            continue;
        }
        let dep_ids = deps_db::list_dependency_ids(&mut *conn, subtask.id).await?;
        if dep_ids.is_empty() {
            dispatch::mark_ready(conn, subtask.id).await?;
        } else {
            dispatch::mark_blocked_on_dependency(conn, subtask.id).await?;
        }
    }

    Ok(())
}

/// `OnMerged(subtaskID)`: for every dependent of a just-merged subtask,
/// unblock it if it has zero remaining unmerged dependencies. Subtasks
/// blocked by `FAILURE` are never touched here — only explicit retry moves
/// them out of that state. Runs inside the caller's transaction so the
/// unblock cascade and the merge it followed commit atomically (§4.A).
pub async fn on_merged(conn: &mut PgConnection, subtask_id: Uuid) -> CoreResult<Vec<Uuid>> {
    let candidates = subtasks_db::list_unblocked_dependents(&mut *conn, subtask_id).await?;

    let mut unblocked = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let remaining = subtasks_db::count_unmerged_dependencies(&mut *conn, candidate.id).await?;
        if remaining == 0 {
            dispatch::unblock_dependency(conn, candidate.id).await?;
            tracing::info!(
                subtask_id = %candidate.id,
                unblocked_by = %subtask_id,
                "subtask unblocked"
            );
            unblocked.push(candidate.id);
        }
    }

    Ok(unblocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn acyclic_chain_passes() {
        let a = uuid(1);
        let b = uuid(2);
        let c = uuid(3);
        let edges = vec![
            DeclaredEdge { subtask: b, depends_on: a },
            DeclaredEdge { subtask: c, depends_on: b },
        ];
        assert!(check_acyclic(&[a, b, c], &edges).is_ok());
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let a = uuid(1);
        let b = uuid(2);
        let edges = vec![
            DeclaredEdge { subtask: a, depends_on: b },
            DeclaredEdge { subtask: b, depends_on: a },
        ];
        let err = check_acyclic(&[a, b], &edges).unwrap_err();
        assert!(matches!(err, CoreError::PlanCycle { .. }));
    }

    #[test]
    fn self_loop_is_rejected() {
        let a = uuid(1);
        let edges = vec![DeclaredEdge { subtask: a, depends_on: a }];
        let err = check_acyclic(&[a], &edges).unwrap_err();
        assert!(matches!(err, CoreError::PlanCycle { .. }));
    }

    #[test]
    fn diamond_shape_passes() {
        let a = uuid(1);
        let b = uuid(2);
        let c = uuid(3);
        let d = uuid(4);
        let edges = vec![
            DeclaredEdge { subtask: b, depends_on: a },
            DeclaredEdge { subtask: c, depends_on: a },
            DeclaredEdge { subtask: d, depends_on: b },
            DeclaredEdge { subtask: d, depends_on: c },
        ];
        assert!(check_acyclic(&[a, b, c, d], &edges).is_ok());
    }

    #[test]
    fn disconnected_nodes_pass() {
        let a = uuid(1);
        let b = uuid(2);
        assert!(check_acyclic(&[a, b], &[]).is_ok());
    }
}
