//! GitHub integration: opening the pull request a Worker's branch lands in.
//!
//! Adapted from the teacher's `at-integrations` GitHub client: the same
//! `Octocrab`-backed wrapper, trimmed to the one call the Agent Loop needs
//! (`create_pull_request`) instead of the full issues/PRs/labels surface.

use octocrab::Octocrab;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("missing GitHub token — set GITHUB_TOKEN")]
    MissingToken,

    #[error("owner_repo {0:?} is not in \"owner/repo\" form")]
    InvalidOwnerRepo(String),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

/// A created pull request's identifying fields, recorded on the Subtask.
#[derive(Debug, Clone)]
pub struct CreatedPullRequest {
    pub number: i32,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubClient {
    /// Build a client for `owner_repo` ("owner/repo"), authenticating with
    /// `GITHUB_TOKEN` from the environment (§6 subprocess contract: the same
    /// token is passed to the agent subprocess's env for its own git pushes).
    pub fn for_project(owner_repo: &str) -> Result<Self> {
        let (owner, repo) = owner_repo
            .split_once('/')
            .ok_or_else(|| GitHubError::InvalidOwnerRepo(owner_repo.to_string()))?;

        let token = std::env::var("GITHUB_TOKEN").map_err(|_| GitHubError::MissingToken)?;
        let octocrab = Octocrab::builder().personal_token(token).build()?;

        Ok(Self {
            octocrab,
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    /// `create(head -> base)`, summarizing `body` (typically the Worker's
    /// commit messages) in the PR description.
    pub async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<CreatedPullRequest> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(title, head, base)
            .body(body)
            .send()
            .await?;

        Ok(CreatedPullRequest {
            number: pr.number as i32,
            html_url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
        })
    }
}
