//! Backup directories: `<instance>-<version>-<timestamp>.backup`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::fsops::{clear_dir, move_back, move_contents};
use crate::error::{AppError, Result};
use crate::instance::Instance;
use crate::paths::is_dir_empty;
use crate::validation::resolve_backup_path;

pub const BACKUP_SUFFIX: &str = ".backup";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    /// Directory name, accepted back by restore.
    pub id: String,
    pub path: PathBuf,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl BackupInfo {
    fn from_path(instance: &str, path: PathBuf) -> Option<Self> {
        let id = path.file_name()?.to_str()?.to_string();
        let (version, timestamp) = parse_backup_name(instance, &id)?;
        let created_at = timestamp
            .get(..15)
            .and_then(|ts| chrono::NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok())
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string());
        Some(Self {
            id,
            path,
            version,
            timestamp,
            created_at,
        })
    }
}

/// Split a backup directory name into `(version, timestamp)`.
///
/// The timestamp never contains `-`, so versions may.
pub fn parse_backup_name(instance: &str, dir_name: &str) -> Option<(String, String)> {
    let stem = dir_name.strip_suffix(BACKUP_SUFFIX)?;
    let rest = stem.strip_prefix(instance)?.strip_prefix('-')?;
    let (version, timestamp) = rest.rsplit_once('-')?;
    if version.is_empty() || timestamp.is_empty() {
        return None;
    }
    Some((version.to_string(), timestamp.to_string()))
}

/// First free backup directory name for `version` at the current time.
fn next_backup_dir(instance: &Instance, version: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
    let backups_dir = instance.backups_dir();
    let base = format!("{}-{}-{}", instance.name, version, timestamp);
    let mut candidate = backups_dir.join(format!("{}{}", base, BACKUP_SUFFIX));
    let mut n = 1;
    while candidate.exists() {
        candidate = backups_dir.join(format!("{}_{}{}", base, n, BACKUP_SUFFIX));
        n += 1;
    }
    candidate
}

/// Backups of `instance`, newest first.
pub fn list_backups(instance: &Instance) -> Result<Vec<BackupInfo>> {
    let backups_dir = instance.backups_dir();
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(&backups_dir)
        .map_err(|e| AppError::io(format!("Failed to read backups dir: {}", e)))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match BackupInfo::from_path(&instance.name, path.clone()) {
            Some(info) => backups.push(info),
            None => log::debug!("Ignoring unrecognized entry {:?}", path),
        }
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
    Ok(backups)
}

/// Move the install directory's contents into a new backup directory.
///
/// Returns `None` without touching the filesystem when there is nothing to
/// preserve. On failure the moved entries are put back and the backup
/// directory is removed.
pub fn create_backup(instance: &Instance) -> Result<Option<BackupInfo>> {
    let install_dir = instance.install_dir();
    if is_dir_empty(&install_dir)? {
        log::info!("Install directory of {} is empty, no backup needed", instance.name);
        return Ok(None);
    }

    let version = if instance.is_installed() {
        instance.installed_version.as_str()
    } else {
        "0"
    };
    fs::create_dir_all(instance.backups_dir())
        .map_err(|e| AppError::io(format!("Failed to create backups dir: {}", e)))?;
    let backup_dir = next_backup_dir(instance, version);
    fs::create_dir(&backup_dir)
        .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", backup_dir, e)))?;

    if let Err((e, moved)) = move_contents(&install_dir, &backup_dir, &[]) {
        move_back(&backup_dir, &install_dir, &moved);
        if let Err(rm) = fs::remove_dir_all(&backup_dir) {
            log::error!("Failed to remove incomplete backup {:?}: {}", backup_dir, rm);
        }
        return Err(e);
    }

    log::info!("Backed up {} to {:?}", instance.name, backup_dir);
    BackupInfo::from_path(&instance.name, backup_dir.clone())
        .map(Some)
        .ok_or_else(|| AppError::other(format!("Unparseable backup name {:?}", backup_dir)))
}

/// Resolve a caller-supplied id, or pick the newest backup when absent.
pub fn find_backup(instance: &Instance, backup_id: Option<&str>) -> Result<BackupInfo> {
    match backup_id {
        Some(id) => {
            let path = resolve_backup_path(&instance.backups_dir(), id)?;
            BackupInfo::from_path(&instance.name, path)
                .ok_or_else(|| AppError::invalid_argument(format!("{} is not a backup of {}", id, instance.name)))
        }
        None => list_backups(instance)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::backup_not_found(&format!("{} (no backups)", instance.name))),
    }
}

/// Move a backup's contents into the install directory and drop the backup.
///
/// A non-empty install directory is only replaced when `overwrite` is set.
pub fn restore_backup(instance: &Instance, backup: &BackupInfo, overwrite: bool) -> Result<()> {
    let install_dir = instance.install_dir();
    if !is_dir_empty(&install_dir)? {
        if !overwrite {
            return Err(AppError::not_empty(&install_dir.display().to_string()));
        }
        log::warn!("Discarding current contents of {:?}", install_dir);
        clear_dir(&install_dir)?;
    }

    if let Err((e, moved)) = move_contents(&backup.path, &install_dir, &[]) {
        move_back(&install_dir, &backup.path, &moved);
        return Err(e);
    }

    remove_empty_dir(&backup.path);
    Ok(())
}

fn remove_empty_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir(dir) {
        log::warn!("Failed to remove {:?}: {}", dir, e);
    }
}
