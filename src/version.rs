//! Latest-version lookup per blueprint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::blueprint::{Blueprint, BlueprintKind};
use crate::error::{AppError, Result};
use crate::github::{fetch_latest_release, GITHUB_API};
use crate::process::{failure_detail, run_tool, shell, stdout_text};
use crate::validation::validate_version_tag;

#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn latest_version(&self, blueprint: &Blueprint) -> Result<String>;
}

/// Picks the lookup from the blueprint's source fields, in order:
/// `github_repo`, `version_command`, then the container image tag.
pub struct BlueprintVersionSource {
    client: Client,
    api_base: String,
}

impl BlueprintVersionSource {
    pub fn new(client: Client) -> Self {
        Self::with_api_base(client, GITHUB_API)
    }

    pub fn with_api_base(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    async fn from_github(&self, blueprint: &Blueprint, repo: &str) -> Result<String> {
        let release = fetch_latest_release(&self.client, &self.api_base, repo)
            .await
            .map_err(|e| AppError::version_check(&blueprint.name, e.to_string()))?;
        Ok(release.tag_name)
    }

    async fn from_command(&self, blueprint: &Blueprint, script: &str) -> Result<String> {
        let output = run_tool(&mut shell(script, None), "sh").await?;
        if !output.status.success() {
            return Err(AppError::version_check(
                &blueprint.name,
                format!("version command failed: {}", failure_detail(&output)),
            ));
        }
        let text = stdout_text(&output);
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::version_check(&blueprint.name, "version command printed nothing")
            })
    }
}

/// Strip a conventional `v` prefix from release tags (`v1.3.0` -> `1.3.0`).
pub fn normalize_version(tag: &str) -> String {
    let tag = tag.trim();
    match tag.strip_prefix('v') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => tag.to_string(),
    }
}

/// Whether `latest` orders before `installed`. Only known when both are semver.
pub fn is_downgrade(installed: &str, latest: &str) -> bool {
    match (
        semver::Version::parse(installed),
        semver::Version::parse(latest),
    ) {
        (Ok(a), Ok(b)) => b < a,
        _ => false,
    }
}

#[async_trait]
impl VersionSource for BlueprintVersionSource {
    async fn latest_version(&self, blueprint: &Blueprint) -> Result<String> {
        let raw = if let Some(repo) = blueprint.source.github_repo.as_deref() {
            self.from_github(blueprint, repo).await?
        } else if let Some(script) = blueprint.source.version_command.as_deref() {
            self.from_command(blueprint, script).await?
        } else if let BlueprintKind::Container(spec) = &blueprint.kind {
            spec.image_tag().ok_or_else(|| {
                AppError::version_check(&blueprint.name, "compose descriptor has no image")
            })?
        } else {
            return Err(AppError::version_check(
                &blueprint.name,
                "blueprint declares no version source",
            ));
        };

        let version = normalize_version(&raw);
        validate_version_tag(&version)
            .map_err(|_| AppError::version_check(&blueprint.name, format!("unusable version {:?}", raw)))?;
        log::debug!("Latest version of {} is {}", blueprint.name, version);
        Ok(version)
    }
}

/// Shared HTTP client for version lookups and downloads.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| AppError::other(format!("Failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::blueprint::{BlueprintSource, ContainerSpec, NativeSpec};

    fn native(source: BlueprintSource) -> Blueprint {
        Blueprint {
            name: "7dtd".into(),
            display_name: "7 Days to Die".into(),
            file: PathBuf::from("/bp/7dtd.bp"),
            kind: BlueprintKind::Native(NativeSpec {
                executable_file: None,
                executable_subdirectory: None,
                executable_arguments: None,
            }),
            ports: String::new(),
            source,
        }
    }

    #[test]
    fn strips_v_prefix_only_before_digits() {
        assert_eq!(normalize_version("v1.3.0"), "1.3.0");
        assert_eq!(normalize_version("vanilla"), "vanilla");
        assert_eq!(normalize_version(" 2024.6.1\n"), "2024.6.1");
    }

    #[test]
    fn downgrade_is_only_detected_for_semver() {
        assert!(is_downgrade("1.10.0", "1.2.0"));
        assert!(!is_downgrade("1.2.0", "1.10.0"));
        assert!(!is_downgrade("build-8", "build-7"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_source_uses_first_line() {
        let source = BlueprintVersionSource::new(Client::new());
        let bp = native(BlueprintSource {
            version_command: Some("printf '\\nv21.1\\nignored\\n'".into()),
            ..BlueprintSource::default()
        });
        assert_eq!(source.latest_version(&bp).await.unwrap(), "21.1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_version_check_error() {
        let source = BlueprintVersionSource::new(Client::new());
        let bp = native(BlueprintSource {
            version_command: Some("exit 4".into()),
            ..BlueprintSource::default()
        });
        assert_eq!(
            source.latest_version(&bp).await.unwrap_err().kind(),
            crate::error::ErrorKind::VersionCheck
        );
    }

    #[tokio::test]
    async fn container_falls_back_to_image_tag() {
        let source = BlueprintVersionSource::new(Client::new());
        let mut bp = native(BlueprintSource::default());
        bp.kind = BlueprintKind::Container(ContainerSpec {
            descriptor: String::new(),
            image: Some("ghcr.io/lloesche/valheim-server:0.217.46".into()),
        });
        assert_eq!(source.latest_version(&bp).await.unwrap(), "0.217.46");
    }

    #[tokio::test]
    async fn no_source_is_version_check_error() {
        let source = BlueprintVersionSource::new(Client::new());
        let err = source
            .latest_version(&native(BlueprintSource::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::VersionCheck);
    }
}
