use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const GITHUB_API: &str = "https://api.github.com";

const USER_AGENT: &str = "gsm-orchestrator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

/// Build the latest-release API URL for `owner/repo`.
pub fn latest_release_url(api_base: &str, repo: &str) -> String {
    format!(
        "{}/repos/{}/releases/latest",
        api_base.trim_end_matches('/'),
        repo.trim_matches('/')
    )
}

pub async fn fetch_latest_release(client: &Client, api_base: &str, repo: &str) -> Result<GitHubRelease> {
    let url = latest_release_url(api_base, repo);
    let resp = client
        .get(&url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "application/vnd.github.v3+json")
        .send()
        .await
        .map_err(|e| AppError::version_check(repo, format!("Failed to fetch release: {}", e)))?;

    if !resp.status().is_success() {
        return Err(AppError::version_check(
            repo,
            format!("GitHub API returned status: {}", resp.status()),
        ));
    }

    resp.json::<GitHubRelease>()
        .await
        .map_err(|e| AppError::version_check(repo, format!("Failed to parse release: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_release_url_is_normalized() {
        assert_eq!(
            latest_release_url("https://api.github.com/", "/PaperMC/Folia/"),
            "https://api.github.com/repos/PaperMC/Folia/releases/latest"
        );
    }

    #[test]
    fn release_parses_with_sparse_fields() {
        let release: GitHubRelease =
            serde_json::from_str(r#"{"tag_name":"v1.3.0","assets":[]}"#).unwrap();
        assert_eq!(release.tag_name, "v1.3.0");
        assert!(!release.prerelease);
    }
}
