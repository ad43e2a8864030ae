//! Fetching a blueprint version into a staging directory.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::Client;

use crate::archive::{unpack, ArchiveFormat};
use crate::blueprint::{Blueprint, BlueprintKind};
use crate::error::{AppError, Result};
use crate::process::{failure_detail, run_tool, shell, COMPOSE_FILE};

/// Environment variable telling a download command where to put files.
pub const DOWNLOAD_DIR_ENV: &str = "GSM_DOWNLOAD_DIR";

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Place the files of `version` into `dest`, which exists and is empty.
    async fn fetch(&self, blueprint: &Blueprint, version: &str, dest: &Path) -> Result<()>;
}

pub async fn download_file(client: &Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }

    let resp = client
        .get(url)
        .header("User-Agent", "gsm-orchestrator")
        .send()
        .await
        .map_err(|e| AppError::download(format!("{}: {}", url, e)))?;

    if !resp.status().is_success() {
        return Err(AppError::download(format!("{}: status {}", url, resp.status())));
    }

    let mut file = fs::File::create(dest).map_err(|e| AppError::io(e.to_string()))?;

    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::download(format!("{}: {}", url, e)))?;
        file.write_all(&chunk)
            .map_err(|e| AppError::io(e.to_string()))?;
    }

    Ok(())
}

/// Substitute `{version}` in a download URL template.
pub fn render_url(template: &str, version: &str) -> String {
    template.replace("{version}", version)
}

/// File name a URL would be saved under.
fn url_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Chooses the backend from the blueprint: container descriptors are copied,
/// otherwise `download_command` wins over `download_url`.
pub struct BlueprintDownloader {
    client: Client,
}

impl BlueprintDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn via_command(&self, script: &str, version: &str, dest: &Path) -> Result<()> {
        let mut cmd = shell(script, Some(dest));
        cmd.env(DOWNLOAD_DIR_ENV, dest).env("GSM_VERSION", version);
        let output = run_tool(&mut cmd, "sh").await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AppError::download(format!(
                "download command failed: {}",
                failure_detail(&output)
            )))
        }
    }

    async fn via_url(&self, template: &str, version: &str, dest: &Path) -> Result<()> {
        let url = render_url(template, version);
        let file_name = url_file_name(&url);
        let Some(format) = ArchiveFormat::detect(&file_name) else {
            return download_file(&self.client, &url, &dest.join(&file_name)).await;
        };

        // Keep the archive next to, not inside, the staging directory.
        let archive = dest.with_extension(format!("download-{}", file_name));
        download_file(&self.client, &url, &archive).await?;
        let result = unpack(&archive, dest, format);
        if let Err(e) = fs::remove_file(&archive) {
            log::warn!("Failed to remove {:?}: {}", archive, e);
        }
        result
    }
}

#[async_trait]
impl Downloader for BlueprintDownloader {
    async fn fetch(&self, blueprint: &Blueprint, version: &str, dest: &Path) -> Result<()> {
        if let Some(script) = blueprint.source.download_command.as_deref() {
            log::info!("Downloading {} {} via command", blueprint.name, version);
            return self.via_command(script, version, dest).await;
        }
        if let Some(template) = blueprint.source.download_url.as_deref() {
            log::info!("Downloading {} {} via URL", blueprint.name, version);
            return self.via_url(template, version, dest).await;
        }
        if let BlueprintKind::Container(spec) = &blueprint.kind {
            fs::write(dest.join(COMPOSE_FILE), &spec.descriptor)
                .map_err(|e| AppError::io(format!("Failed to stage compose file: {}", e)))?;
            return Ok(());
        }
        Err(AppError::download(format!(
            "Blueprint {} declares no download source",
            blueprint.name
        )))
    }
}
