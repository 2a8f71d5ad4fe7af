//! Tracker CLI contract (§6).
//!
//! Agents record issues and dependencies in an external tracker by shelling
//! out to a CLI inside their worktree. The core reads that state back the
//! same way: by shelling out again and parsing tolerant, line-oriented
//! output. Absence of the CLI binary is a fatal startup error, checked once
//! via [`TrackerClient::verify_available`].

use std::path::Path;
use std::process::Command;

use crate::error::SyncError;

/// One issue as reported by the tracker CLI's `show`/`list` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIssue {
    pub id: String,
    pub title: String,
    pub spec: Option<String>,
    pub plan: Option<String>,
    pub closed: bool,
}

/// A dependency edge as reported by `dep list <id>`: `id` depends on
/// `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerDependency {
    pub id: String,
    pub depends_on: String,
}

/// Thin wrapper around the tracker CLI binary.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    cli_path: std::path::PathBuf,
}

impl TrackerClient {
    pub fn new(cli_path: impl Into<std::path::PathBuf>) -> Self {
        Self { cli_path: cli_path.into() }
    }

    /// Fail fast at startup if the tracker CLI binary cannot be invoked.
    pub fn verify_available(&self) -> Result<(), SyncError> {
        Command::new(&self.cli_path)
            .arg("--version")
            .output()
            .map_err(|e| SyncError::TrackerCommand(format!("{}: {e}", self.cli_path.display())))?;
        Ok(())
    }

    /// `list --epic <id>`: every issue tracked under an epic.
    pub fn list_under_epic(&self, worktree: &Path, epic_id: &str) -> Result<Vec<TrackerIssue>, SyncError> {
        let output = self.run(worktree, &["list", "--epic", epic_id])?;
        parse_issue_list(&output)
    }

    /// `show <id>`: a single issue's current state.
    pub fn show(&self, worktree: &Path, id: &str) -> Result<TrackerIssue, SyncError> {
        let output = self.run(worktree, &["show", id])?;
        parse_issue_list(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Parse(format!("tracker show returned no issue for {id}")))
    }

    /// `dep list <id>`: direct dependencies declared for an issue.
    pub fn list_dependencies(&self, worktree: &Path, id: &str) -> Result<Vec<TrackerDependency>, SyncError> {
        let output = self.run(worktree, &["dep", "list", id])?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_once(char::is_whitespace))
            .map(|(depends_on, _rest)| TrackerDependency {
                id: id.to_string(),
                depends_on: depends_on.trim().to_string(),
            })
            .collect())
    }

    /// `close <id> --reason <text>`.
    pub fn close(&self, worktree: &Path, id: &str, reason: &str) -> Result<(), SyncError> {
        self.run(worktree, &["close", id, "--reason", reason])?;
        Ok(())
    }

    fn run(&self, worktree: &Path, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new(&self.cli_path)
            .args(args)
            .current_dir(worktree)
            .output()
            .map_err(|e| SyncError::TrackerCommand(format!("{}: {e}", self.cli_path.display())))?;

        if !output.status.success() {
            return Err(SyncError::TrackerCommand(format!(
                "{} {:?} exited with {}: {}",
                self.cli_path.display(),
                args,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse tab-separated tracker output: `id\ttitle\t[spec]\t[plan]\t[closed]`.
/// Trailing fields may be absent (tolerant parsing per §6).
fn parse_issue_list(output: &str) -> Result<Vec<TrackerIssue>, SyncError> {
    let mut issues = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let id = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Parse(format!("missing id in tracker line: {line:?}")))?
            .to_string();
        let title = fields.next().unwrap_or("").to_string();
        let spec = fields.next().filter(|s| !s.is_empty()).map(String::from);
        let plan = fields.next().filter(|s| !s.is_empty()).map(String::from);
        let closed = fields.next().map(|s| s == "closed").unwrap_or(false);
        issues.push(TrackerIssue { id, title, spec, plan, closed });
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_line() {
        let out = "PROJ-1\tAdd login\tspec text\tplan text\topen\n";
        let issues = parse_issue_list(out).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "PROJ-1");
        assert_eq!(issues[0].title, "Add login");
        assert_eq!(issues[0].spec.as_deref(), Some("spec text"));
        assert!(!issues[0].closed);
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let out = "PROJ-2\tJust a title\n";
        let issues = parse_issue_list(out).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].spec, None);
        assert_eq!(issues[0].plan, None);
    }

    #[test]
    fn rejects_line_with_empty_id() {
        let out = "\tTitle\n";
        assert!(parse_issue_list(out).is_err());
    }

    #[test]
    fn skips_blank_lines() {
        let out = "PROJ-1\tA\n\nPROJ-2\tB\n";
        let issues = parse_issue_list(out).unwrap();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn closed_marker_is_tolerant_of_case() {
        let out = "PROJ-1\tA\t\t\tclosed\n";
        let issues = parse_issue_list(out).unwrap();
        assert!(issues[0].closed);
    }

    #[test]
    fn list_dependencies_parses_depends_on_column() {
        let out = "PROJ-1\tdepends on PROJ-2\n";
        let deps: Vec<TrackerDependency> = out
            .lines()
            .filter_map(|line| line.split_once(char::is_whitespace))
            .map(|(depends_on, _rest)| TrackerDependency { id: "PROJ-3".to_string(), depends_on: depends_on.trim().to_string() })
            .collect();
        assert_eq!(deps[0].depends_on, "PROJ-1");
    }

    #[test]
    fn verify_available_fails_for_missing_binary() {
        let client = TrackerClient::new("/nonexistent/tracker/cli");
        assert!(client.verify_available().is_err());
    }
}
