//! Library-facing error taxonomy.
//!
//! One variant per error kind named in §7 of the orchestration spec, so
//! callers can match on kind (e.g. to decide retryability) instead of
//! parsing strings. Application/orchestration-level code instead uses
//! `anyhow::Result` with `.context(...)` — see the agent loop and CLI.

use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("plan cycle detected: {cycle_path}")]
    PlanCycle { cycle_path: String },

    #[error("invariant {invariant} violated: {description}")]
    InvariantViolation {
        invariant: &'static str,
        description: String,
    },

    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Database(anyhow::Error::new(e))
    }
}

/// Raised when a process executed by the [`crate::executor`] fails.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("process exited with code {code}: {tail}")]
    NonZeroExit { code: i32, tail: String },
}

/// Raised by the [`crate::sync`] reconciler when the tracker state cannot
/// be read or parsed.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("tracker CLI failed: {0}")]
    TrackerCommand(String),

    #[error("failed to parse tracker output: {0}")]
    Parse(String),
}
