//! Pull request API client.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::ledger::RepositoryBinding;

/// Repository metadata needed for PR creation.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryInfo {
    pub default_branch: String,
}

/// Creates pull requests against a hosting provider. Stateless; the
/// token is passed per call so one client serves all sessions.
#[async_trait]
pub trait PullRequestApi: Send + Sync {
    async fn get_repository(
        &self,
        repository: &RepositoryBinding,
        token: &str,
    ) -> Result<RepositoryInfo>;

    /// Returns the URL of the created pull request.
    async fn create_pull_request(
        &self,
        repository: &RepositoryBinding,
        token: &str,
        title: &str,
        body: &str,
        branch: &str,
        base_branch: &str,
    ) -> Result<String>;
}

/// GitHub REST implementation.
pub struct GitHubPrClient {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubPrClient {
    pub fn new() -> Self {
        Self::with_api_base("https://api.github.com")
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }

    /// "owner/repo" from the binding's name, or parsed from its URL.
    fn owner_repo(repository: &RepositoryBinding) -> Result<String> {
        if repository.name.matches('/').count() == 1 {
            return Ok(repository.name.clone());
        }

        let trimmed = repository
            .url
            .trim_end_matches('/')
            .trim_end_matches(".git");
        let mut parts = trimmed.rsplit('/');
        match (parts.next(), parts.next()) {
            (Some(repo), Some(owner)) if !repo.is_empty() && !owner.is_empty() => {
                Ok(format!("{}/{}", owner, repo))
            }
            _ => bail!("cannot determine owner/repo from {}", repository.url),
        }
    }
}

impl Default for GitHubPrClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PullRequestApi for GitHubPrClient {
    async fn get_repository(
        &self,
        repository: &RepositoryBinding,
        token: &str,
    ) -> Result<RepositoryInfo> {
        let owner_repo = Self::owner_repo(repository)?;
        let response = self
            .http
            .get(format!("{}/repos/{}", self.api_base, owner_repo))
            .bearer_auth(token)
            .header("User-Agent", "korvo")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("fetching repository metadata")?;

        if !response.status().is_success() {
            bail!(
                "repository lookup for {} failed with {}",
                owner_repo,
                response.status()
            );
        }

        response
            .json::<RepositoryInfo>()
            .await
            .context("parsing repository metadata")
    }

    async fn create_pull_request(
        &self,
        repository: &RepositoryBinding,
        token: &str,
        title: &str,
        body: &str,
        branch: &str,
        base_branch: &str,
    ) -> Result<String> {
        let owner_repo = Self::owner_repo(repository)?;
        let response = self
            .http
            .post(format!("{}/repos/{}/pulls", self.api_base, owner_repo))
            .bearer_auth(token)
            .header("User-Agent", "korvo")
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "title": title,
                "body": body,
                "head": branch,
                "base": base_branch,
            }))
            .send()
            .await
            .context("creating pull request")?;

        if !response.status().is_success() {
            bail!(
                "pull request creation for {} failed with {}",
                owner_repo,
                response.status()
            );
        }

        #[derive(Deserialize)]
        struct PrResponse {
            html_url: String,
        }

        let pr: PrResponse = response
            .json()
            .await
            .context("parsing pull request response")?;
        Ok(pr.html_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(url: &str, name: &str) -> RepositoryBinding {
        RepositoryBinding {
            url: url.to_string(),
            name: name.to_string(),
            branch: None,
        }
    }

    #[test]
    fn test_owner_repo_from_name() {
        let b = binding("https://github.com/acme/widget.git", "acme/widget");
        assert_eq!(GitHubPrClient::owner_repo(&b).unwrap(), "acme/widget");
    }

    #[test]
    fn test_owner_repo_parsed_from_url() {
        let b = binding("https://github.com/acme/widget.git", "widget");
        assert_eq!(GitHubPrClient::owner_repo(&b).unwrap(), "acme/widget");
    }

    #[test]
    fn test_owner_repo_handles_trailing_slash() {
        let b = binding("https://github.com/acme/widget/", "widget");
        assert_eq!(GitHubPrClient::owner_repo(&b).unwrap(), "acme/widget");
    }
}
