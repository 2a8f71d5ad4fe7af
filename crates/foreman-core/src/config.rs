//! Layered configuration for the orchestration core.
//!
//! One struct per concern, each with a `from_env()` constructor reading the
//! variables named in SPEC_FULL.md §6, prefixed `FOREMAN_` to match the
//! surrounding stack's env-var convention. [`ServiceConfig::resolve`]
//! applies the full CLI-flag > env-var > file > default chain and returns
//! a config that downstream code treats as final (no further fallback).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Process Executor defaults (§4.B).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Grace period after a soft cancel signal before forcible termination.
    pub kill_grace_period: Duration,
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            kill_grace_period: Duration::from_secs(10),
        })
    }
}

/// Log Tailer defaults (§4.C, §6).
#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub poll_interval: Duration,
    pub max_line_bytes: usize,
}

impl TailerConfig {
    pub fn from_env() -> Result<Self> {
        let poll_ms: u64 = env_parsed("FOREMAN_LOG_TAIL_POLL_MS", 100)?;
        let max_line_bytes: usize = env_parsed("FOREMAN_LOG_TAIL_MAX_LINE_BYTES", 1_048_576)?;
        if max_line_bytes == 0 {
            bail!("FOREMAN_LOG_TAIL_MAX_LINE_BYTES must be positive");
        }
        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms),
            max_line_bytes,
        })
    }
}

/// Event Hub defaults (§4.D, §6).
#[derive(Debug, Clone)]
pub struct EventHubConfig {
    pub channel_buffer: usize,
    pub max_connections_per_user: usize,
    pub heartbeat_interval: Duration,
}

impl EventHubConfig {
    pub fn from_env() -> Result<Self> {
        let channel_buffer: usize = env_parsed("FOREMAN_EVENT_CHANNEL_BUFFER", 100)?;
        let max_connections_per_user: usize =
            env_parsed("FOREMAN_SSE_MAX_CONNECTIONS_PER_USER", 5)?;
        let heartbeat_s: u64 = env_parsed("FOREMAN_SSE_HEARTBEAT_INTERVAL_S", 30)?;
        if channel_buffer == 0 {
            bail!("FOREMAN_EVENT_CHANNEL_BUFFER must be positive");
        }
        if max_connections_per_user == 0 {
            bail!("FOREMAN_SSE_MAX_CONNECTIONS_PER_USER must be positive");
        }
        Ok(Self {
            channel_buffer,
            max_connections_per_user,
            heartbeat_interval: Duration::from_secs(heartbeat_s),
        })
    }
}

/// External Sync defaults (§4.G, §6).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub tracker_cli_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let interval_s: u64 = env_parsed("FOREMAN_SYNC_INTERVAL_SECONDS", 30)?;
        if interval_s == 0 {
            bail!("FOREMAN_SYNC_INTERVAL_SECONDS must be positive");
        }
        let tracker_cli_path = env::var("FOREMAN_TRACKER_CLI_PATH")
            .unwrap_or_else(|_| "tracker".to_string())
            .into();
        Ok(Self {
            interval: Duration::from_secs(interval_s),
            tracker_cli_path,
        })
    }
}

/// Worktree Manager defaults (§4.H).
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Root directory under which per-project worktree subdirectories live.
    /// Defaults to a sibling of each project's `clone_path`, unless overridden.
    pub base_dir_override: Option<PathBuf>,
}

impl WorktreeConfig {
    pub fn from_env() -> Result<Self> {
        let base_dir_override = env::var("FOREMAN_WORKTREE_BASE_DIR").ok().map(PathBuf::from);
        Ok(Self { base_dir_override })
    }
}

/// Agent Loop defaults (§4.I, §6).
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_retries: u32,
    /// Grace window after which a `RUNNING` run is presumed orphaned.
    pub orphan_grace_window: Duration,
}

impl AgentLoopConfig {
    pub fn from_env() -> Result<Self> {
        let max_retries: u32 = env_parsed("FOREMAN_AGENT_MAX_RETRIES", 10)?;
        if max_retries == 0 {
            bail!("FOREMAN_AGENT_MAX_RETRIES must be positive");
        }
        Ok(Self {
            max_retries,
            orphan_grace_window: Duration::from_secs(120),
        })
    }

    /// Exponential backoff before the next retry attempt:
    /// `min(30s * 2^(n-1), 10min)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let secs = 30u64.saturating_mul(1u64 << retry_count.saturating_sub(1).min(63));
        Duration::from_secs(secs.min(600))
    }
}

/// Fully resolved configuration for the orchestration core, aggregating
/// every per-concern config plus the filesystem root for logs/worktrees.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db: foreman_db::config::DbConfig,
    pub data_dir: PathBuf,
    pub executor: ExecutorConfig,
    pub tailer: TailerConfig,
    pub event_hub: EventHubConfig,
    pub sync: SyncConfig,
    pub worktree: WorktreeConfig,
    pub agent_loop: AgentLoopConfig,
}

/// CLI-level overrides accepted at the top of the resolution chain.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Resolve the full configuration: CLI flag > env var > compiled
    /// default. An on-disk config file (handled by `foreman-cli`) may
    /// supply the database URL and tracker CLI path ahead of this call by
    /// populating the corresponding env vars before `resolve` runs.
    pub fn resolve(cli: CliOverrides) -> Result<Self> {
        let db = match cli.database_url {
            Some(url) => foreman_db::config::DbConfig::new(url),
            None => foreman_db::config::DbConfig::from_env(),
        };

        let data_dir = cli
            .data_dir
            .or_else(|| env::var("FOREMAN_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(Self {
            db,
            data_dir,
            executor: ExecutorConfig::from_env().context("resolving executor config")?,
            tailer: TailerConfig::from_env().context("resolving log tailer config")?,
            event_hub: EventHubConfig::from_env().context("resolving event hub config")?,
            sync: SyncConfig::from_env().context("resolving sync config")?,
            worktree: WorktreeConfig::from_env().context("resolving worktree config")?,
            agent_loop: AgentLoopConfig::from_env().context("resolving agent loop config")?,
        })
    }

    /// `<data_dir>/logs/<project>/<task>/<subtask-or-__planner__>/`
    pub fn log_dir(&self, project_id: uuid::Uuid, task_id: uuid::Uuid, subtask_label: &str) -> PathBuf {
        self.data_dir
            .join("logs")
            .join(project_id.to_string())
            .join(task_id.to_string())
            .join(subtask_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = AgentLoopConfig {
            max_retries: 10,
            orphan_grace_window: Duration::from_secs(120),
        };
        assert_eq!(cfg.backoff(1), Duration::from_secs(30));
        assert_eq!(cfg.backoff(2), Duration::from_secs(60));
        assert_eq!(cfg.backoff(3), Duration::from_secs(120));
        assert_eq!(cfg.backoff(20), Duration::from_secs(600));
    }

    #[test]
    fn resolve_defaults_data_dir() {
        let _ = env::remove_var("FOREMAN_DATA_DIR");
        let cfg = ServiceConfig::resolve(CliOverrides::default()).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
    }
}
