//! Worktree Manager (§4.H).
//!
//! Provisions an isolated git worktree and branch per Subtask so Worker
//! agents never share a working directory, and reclaims both once a
//! Subtask is merged. Adapted from the teacher's generic worktree
//! lifecycle: the git plumbing (create/remove/list/prune/porcelain
//! parsing) is unchanged, but `Provision`/`Reclaim` now bind to a Subtask
//! row instead of a free-floating branch name, and there is no
//! `merge_branch`/`checkout` here — PRs are merged on GitHub, not locally.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use foreman_db::models::{Project, Subtask};
use foreman_db::queries::subtasks as subtasks_db;
use sqlx::PgPool;
use thiserror::Error;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(
        "worktree path exists but has unexpected branch: expected {expected}, found {found}"
    )]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),

    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<sqlx::Error> for WorktreeError {
    fn from(e: sqlx::Error) -> Self {
        WorktreeError::Database(anyhow::Error::new(e))
    }
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages git worktrees for Subtask isolation.
///
/// Git serializes mutating worktree operations on the same repository via
/// a lock file on the shared object store; this manager mirrors that by
/// serializing all mutating git calls through an internal mutex, one per
/// project.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    default_branch: String,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            default_branch: self.default_branch.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Open a manager for `project`, rooted at its `clone_path`. Worktrees
    /// land under `worktree_base` (or, if `None`, a sibling directory named
    /// `<repo-name>-foreman-worktrees`).
    pub fn for_project(
        project: &Project,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        Self::new(&project.clone_path, &project.default_branch, worktree_base)
    }

    fn new(
        repo_path: impl Into<PathBuf>,
        default_branch: &str,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path.file_name().and_then(|n| n.to_str()).unwrap_or("repo");
            let base_name = format!("{repo_name}-foreman-worktrees");
            repo_path.parent().map(|p| p.join(&base_name)).unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            default_branch: default_branch.to_string(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Derive a branch name from a subtask's tracker issue id (if any) and
    /// slugified title: `foreman/<issue-or-id-prefix>-<slug>`.
    pub fn branch_name_for(subtask: &Subtask) -> String {
        let slug = slugify(&subtask.title);
        match &subtask.tracker_issue_id {
            Some(issue_id) => format!("foreman/{issue_id}-{slug}"),
            None => format!("foreman/{}-{slug}", &subtask.id.to_string()[..8]),
        }
    }

    /// `Provision(subtask)`: create a worktree checked out from
    /// `default_branch`, on a freshly created local branch, and persist the
    /// resulting path/branch on the subtask row.
    pub async fn provision(&self, pool: &PgPool, subtask: &Subtask) -> Result<WorktreeInfo, WorktreeError> {
        let branch_name = Self::branch_name_for(subtask);
        let info = self.create_worktree(&branch_name)?;

        subtasks_db::set_worktree_path(
            pool,
            subtask.id,
            &info.path.to_string_lossy(),
            &branch_name,
        )
        .await?;

        Ok(info)
    }

    /// `Reclaim(subtask)`: remove the worktree directory and delete the
    /// local branch. Callers must only invoke this once the subtask is
    /// `MERGED` or the project is being deleted.
    pub async fn reclaim(&self, pool: &PgPool, subtask: &Subtask) -> Result<(), WorktreeError> {
        if let Some(path) = &subtask.worktree_path {
            self.remove_worktree(Path::new(path))?;
        }
        if let Some(branch) = &subtask.branch_name {
            self.delete_branch(branch)?;
        }
        subtasks_db::clear_worktree_path(pool, subtask.id).await?;
        Ok(())
    }

    /// Create a new worktree for `branch_name`, rooted at `default_branch`.
    /// Idempotent: returns the existing worktree if one already matches.
    pub fn create_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref branch) = existing.branch {
                if branch == branch_name {
                    tracing::info!(path = %worktree_path.display(), branch = branch_name, "worktree already exists, returning existing");
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_string(),
                    found: branch.clone(),
                });
            }
            return Ok(existing);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create worktree base directory: {}", self.worktree_base.display()),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree add".into(), source: e })?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(&worktree_path)
                .arg(&self.default_branch)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree add -b".into(), source: e })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Remove a worktree by its path. Idempotent.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "directory exists but not registered as worktree, removing");
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree remove".into(), source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree list".into(), source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Run `git worktree prune` to clean up entries whose directories were
    /// removed externally.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree prune".into(), source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Delete a local branch. Idempotent — a missing branch is not an error.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git branch -D".into(), source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git rev-parse --verify".into(), source: e })?;

        Ok(output.status.success())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!("worktree not found at path: {}", path.display())))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Slugify a title for use in a branch name: lowercase, non-alphanumerics
/// collapsed to single hyphens, trimmed of leading/trailing hyphens.
fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Parse the porcelain output of `git worktree list --porcelain`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo { path, branch: current_branch.take(), head_commit: head });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo { path, branch: current_branch, head_commit: head });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let status = Command::new("git").args(["init", "-b", "main"]).current_dir(&repo_path).output().expect("git init");
        assert!(status.status.success());

        let _ = Command::new("git").args(["config", "user.email", "test@foreman.dev"]).current_dir(&repo_path).output();
        let _ = Command::new("git").args(["config", "user.name", "Foreman Test"]).current_dir(&repo_path).output();

        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        let _ = Command::new("git").args(["add", "."]).current_dir(&repo_path).output();
        let status = Command::new("git").args(["commit", "-m", "Initial commit"]).current_dir(&repo_path).output().unwrap();
        assert!(status.status.success());

        (dir, repo_path)
    }

    fn test_subtask(tracker_issue_id: Option<&str>, title: &str) -> Subtask {
        use chrono::Utc;
        use uuid::Uuid;
        Subtask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            title: title.to_string(),
            spec: None,
            plan: None,
            status: foreman_db::models::SubtaskStatus::Ready,
            blocked_reason: None,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            retry_count: 0,
            token_usage: 0,
            position: 1024.0,
            tracker_issue_id: tracker_issue_id.map(String::from),
            worktree_path: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn new_with_valid_repo() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path, "main", None);
        assert!(mgr.is_ok());
    }

    #[test]
    fn new_with_invalid_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), "main", None);
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_name_uses_tracker_issue_id() {
        let subtask = test_subtask(Some("PROJ-42"), "Add OAuth login flow");
        assert_eq!(WorktreeManager::branch_name_for(&subtask), "foreman/PROJ-42-add-oauth-login-flow");
    }

    #[test]
    fn branch_name_falls_back_to_id_prefix() {
        let subtask = test_subtask(None, "Refactor parser");
        let branch = WorktreeManager::branch_name_for(&subtask);
        assert!(branch.starts_with("foreman/"));
        assert!(branch.ends_with("-refactor-parser"));
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, "main", Some(worktree_base.path().to_path_buf())).unwrap();

        let info = mgr.create_worktree("foreman/test-task").expect("create_worktree failed");
        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some("foreman/test-task"));

        let worktrees = mgr.list_worktrees().unwrap();
        assert!(worktrees.len() >= 2);
    }

    #[test]
    fn create_worktree_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, "main", Some(worktree_base.path().to_path_buf())).unwrap();

        let info1 = mgr.create_worktree("foreman/idempotent").unwrap();
        let info2 = mgr.create_worktree("foreman/idempotent").unwrap();
        assert_eq!(info1.path, info2.path);
    }

    #[test]
    fn remove_worktree_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, "main", Some(worktree_base.path().to_path_buf())).unwrap();

        let info = mgr.create_worktree("foreman/remove-task").unwrap();
        mgr.remove_worktree(&info.path).unwrap();
        assert!(!info.path.exists());
        mgr.remove_worktree(&info.path).unwrap();
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path, "main", None).unwrap();
        mgr.delete_branch("foreman/nonexistent").expect("deleting nonexistent branch should not fail");
    }

    #[test]
    fn parse_porcelain_output_parses_multiple_entries() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/foreman/feature

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch.as_deref(), Some("foreman/feature"));
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn slugify_collapses_non_alphanumerics() {
        assert_eq!(slugify("Add OAuth login flow!"), "add-oauth-login-flow");
        assert_eq!(slugify("  leading and trailing  "), "leading-and-trailing");
    }
}
