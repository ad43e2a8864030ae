use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub fn validate_instance_name(name: &str) -> Result<()> {
    if !is_safe_name(name) {
        return Err(AppError::invalid_argument(format!(
            "Invalid instance name {:?}",
            name
        )));
    }
    Ok(())
}

pub fn validate_blueprint_name(name: &str) -> Result<()> {
    if !is_safe_name(name) {
        return Err(AppError::invalid_argument(format!(
            "Invalid blueprint name {:?}",
            name
        )));
    }
    Ok(())
}

pub fn validate_version_tag(version: &str) -> Result<()> {
    let is_safe = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));

    if !is_safe {
        return Err(AppError::invalid_argument(format!(
            "Invalid version {:?}",
            version
        )));
    }

    Ok(())
}

/// Resolve a backup identifier to a directory inside `backups_dir`.
///
/// Only the final path component of `backup_id` is used, so callers may pass
/// either a bare directory name or a full path.
pub fn resolve_backup_path(backups_dir: &Path, backup_id: &str) -> Result<PathBuf> {
    let file_name = Path::new(backup_id)
        .file_name()
        .ok_or_else(|| AppError::invalid_argument("Invalid backup id"))?;

    let candidate = backups_dir.join(file_name);
    if !is_backup_dirname(&candidate) {
        return Err(AppError::invalid_argument(format!(
            "Invalid backup name {:?}",
            file_name
        )));
    }
    if !candidate.is_dir() {
        return Err(AppError::backup_not_found(backup_id));
    }

    let backups_dir_canonical = fs::canonicalize(backups_dir)
        .map_err(|e| AppError::io(format!("Failed to resolve backups dir: {}", e)))?;
    let canonical_candidate = candidate
        .canonicalize()
        .map_err(|e| AppError::io(format!("Failed to resolve backup path: {}", e)))?;

    if !canonical_candidate.starts_with(&backups_dir_canonical) {
        return Err(AppError::invalid_argument(
            "Backup path is outside backups directory",
        ));
    }

    Ok(canonical_candidate)
}

fn is_backup_dirname(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".backup") && !name.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names() {
        assert!(validate_instance_name("factorio-3821").is_ok());
        assert!(validate_instance_name("7dtd_main.v2").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("../etc").is_err());
        assert!(validate_instance_name(".hidden").is_err());
        assert!(validate_instance_name("a b").is_err());
    }

    #[test]
    fn version_tags() {
        assert!(validate_version_tag("1.2.0").is_ok());
        assert!(validate_version_tag("build-1234+rc1").is_ok());
        assert!(validate_version_tag("").is_err());
        assert!(validate_version_tag("1.0/../../x").is_err());
    }

    #[test]
    fn backup_paths_stay_inside_backups_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        let name = "srv-1.0-20240101_000000.backup";
        fs::create_dir_all(backups.join(name)).unwrap();

        let resolved = resolve_backup_path(&backups, name).unwrap();
        assert!(resolved.ends_with(name));

        let via_other_dir = format!("/elsewhere/{}", name);
        assert!(resolve_backup_path(&backups, &via_other_dir).is_ok());

        assert!(resolve_backup_path(&backups, "not-a-backup").is_err());
        let missing = resolve_backup_path(&backups, "srv-2.0-20240101_000000.backup");
        assert_eq!(
            missing.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }
}
