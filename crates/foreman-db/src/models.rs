use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    PlanningFailed,
    Active,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::PlanningFailed => "planning_failed",
            Self::Active => "active",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "planning_failed" => Ok(Self::PlanningFailed),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a Subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    Blocked,
    InProgress,
    Completed,
    Merged,
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Merged => "merged",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "blocked" => Ok(Self::Blocked),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "merged" => Ok(Self::Merged),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Reason a Subtask is blocked. Must be set iff `status = Blocked` (I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    Dependency,
    Failure,
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dependency => "dependency",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockedReason {
    type Err = BlockedReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dependency" => Ok(Self::Dependency),
            "failure" => Ok(Self::Failure),
            other => Err(BlockedReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BlockedReason`] string.
#[derive(Debug, Clone)]
pub struct BlockedReasonParseError(pub String);

impl fmt::Display for BlockedReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid blocked reason: {:?}", self.0)
    }
}

impl std::error::Error for BlockedReasonParseError {}

// ---------------------------------------------------------------------------

/// Which role an `AgentRun` was executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Planner,
    Worker,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = AgentTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(Self::Planner),
            "worker" => Ok(Self::Worker),
            other => Err(AgentTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentType`] string.
#[derive(Debug, Clone)]
pub struct AgentTypeParseError(pub String);

impl fmt::Display for AgentTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent type: {:?}", self.0)
    }
}

impl std::error::Error for AgentTypeParseError {}

// ---------------------------------------------------------------------------

/// Terminal/running status of a single `AgentRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRunStatus {
    type Err = AgentRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(AgentRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRunStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentRunStatusParseError(pub String);

impl fmt::Display for AgentRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent run status: {:?}", self.0)
    }
}

impl std::error::Error for AgentRunStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A user. Authentication lives with an external collaborator; we only
/// track the opaque identity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A GitHub repository under orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub owner_repo: String,
    pub default_branch: String,
    pub clone_path: String,
    pub tracker_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// A user-submitted unit of work, decomposed by a Planner into Subtasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub tracker_epic_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A Planner-produced unit of work, implemented by a Worker in its own
/// worktree and branch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    pub spec: Option<String>,
    pub plan: Option<String>,
    pub status: SubtaskStatus,
    pub blocked_reason: Option<BlockedReason>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i32>,
    pub retry_count: i32,
    pub token_usage: i64,
    pub position: f64,
    pub tracker_issue_id: Option<String>,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A directed dependency edge: `subtask_id` depends on `depends_on_id`.
/// The graph within a Task must be a DAG (I6).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubtaskDependency {
    pub subtask_id: Uuid,
    pub depends_on_id: Uuid,
}

/// One execution attempt of a Planner (bound to a Task) or a Worker (bound
/// to a Subtask). Exactly one of `task_id`/`subtask_id` is set, matching
/// `agent_type`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub agent_type: AgentType,
    pub attempt_number: i32,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub token_usage: Option<i64>,
    pub error_message: Option<String>,
    pub log_path: String,
    pub prompt_text: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Planning,
            TaskStatus::PlanningFailed,
            TaskStatus::Active,
            TaskStatus::Done,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn subtask_status_display_roundtrip() {
        let variants = [
            SubtaskStatus::Pending,
            SubtaskStatus::Ready,
            SubtaskStatus::Blocked,
            SubtaskStatus::InProgress,
            SubtaskStatus::Completed,
            SubtaskStatus::Merged,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SubtaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn subtask_status_invalid() {
        assert!("nope".parse::<SubtaskStatus>().is_err());
    }

    #[test]
    fn blocked_reason_display_roundtrip() {
        let variants = [BlockedReason::Dependency, BlockedReason::Failure];
        for v in &variants {
            let s = v.to_string();
            let parsed: BlockedReason = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn blocked_reason_invalid() {
        assert!("because".parse::<BlockedReason>().is_err());
    }

    #[test]
    fn agent_type_display_roundtrip() {
        let variants = [AgentType::Planner, AgentType::Worker];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_type_invalid() {
        assert!("robot".parse::<AgentType>().is_err());
    }

    #[test]
    fn agent_run_status_display_roundtrip() {
        let variants = [
            AgentRunStatus::Running,
            AgentRunStatus::Succeeded,
            AgentRunStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentRunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_run_status_invalid() {
        assert!("magic".parse::<AgentRunStatus>().is_err());
    }
}
