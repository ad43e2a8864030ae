//! Centralized path utilities for the application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Environment variable overriding the data root.
pub const ROOT_ENV: &str = "GSM_HOME";

/// Default data root (~/.gsm).
pub fn default_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return absolute(Path::new(&root));
    }
    let home =
        dirs::home_dir().ok_or_else(|| AppError::invalid_config("Cannot find home directory"))?;
    Ok(home.join(".gsm"))
}

/// Make a path absolute against the current directory without touching the filesystem.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path))
}

/// On-disk layout rooted at the data directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the global config file.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn blueprints_dir(&self) -> PathBuf {
        self.root.join("blueprints")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Default parent for instance working directories.
    pub fn servers_dir(&self) -> PathBuf {
        self.root.join("servers")
    }

    /// Default local event endpoint.
    pub fn events_socket(&self) -> PathBuf {
        self.root.join("events.sock")
    }

    /// Record file for an instance.
    pub fn instance_record(&self, name: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.ini", name))
    }

    pub fn instance_lock(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", name))
    }

    /// Ensure all required data directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.blueprints_dir(),
            self.instances_dir(),
            self.locks_dir(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}

/// Whether a directory is missing or has no entries.
pub fn is_dir_empty(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(true);
    }
    let mut entries =
        fs::read_dir(dir).map_err(|e| AppError::io(format!("Failed to read {:?}: {}", dir, e)))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = Layout::new("/srv/gsm");
        assert_eq!(
            layout.instance_record("valheim-0042"),
            PathBuf::from("/srv/gsm/instances/valheim-0042.ini")
        );
        assert_eq!(
            layout.instance_lock("valheim-0042"),
            PathBuf::from("/srv/gsm/locks/valheim-0042.lock")
        );
        assert_eq!(layout.config_path(), PathBuf::from("/srv/gsm/config.toml"));
    }

    #[test]
    fn empty_dir_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(is_dir_empty(&tmp.path().join("missing")).unwrap());
        assert!(is_dir_empty(tmp.path()).unwrap());
        fs::write(tmp.path().join("a"), "x").unwrap();
        assert!(!is_dir_empty(tmp.path()).unwrap());
    }
}
