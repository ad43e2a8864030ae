//! Instance-related type definitions.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::kv::KvRecord;

/// Which supervision backend runs an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleManager {
    /// A process-manager unit driven through `systemctl`.
    Systemd,
    /// A process spawned and tracked directly via a PID file.
    Standalone,
    /// A `docker compose` project.
    Container,
}

impl LifecycleManager {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Systemd => "systemd",
            Self::Standalone => "standalone",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleManager {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "systemd" => Ok(Self::Systemd),
            "standalone" => Ok(Self::Standalone),
            "container" => Ok(Self::Container),
            other => Err(AppError::invalid_argument(format!(
                "Unknown lifecycle manager {:?}",
                other
            ))),
        }
    }
}

/// Sub-directories every instance owns under its working directory.
pub const DERIVED_DIRS: [(&str, &str); 6] = [
    ("install_dir", "install"),
    ("backups_dir", "backups"),
    ("saves_dir", "saves"),
    ("temp_dir", "temp"),
    ("logs_dir", "logs"),
    ("config_dir", "config"),
];

/// A deployment of a blueprint, as stored in its record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub blueprint: String,
    pub blueprint_file: PathBuf,
    pub working_dir: PathBuf,
    pub lifecycle_manager: LifecycleManager,
    /// Empty or `"0"` when nothing is installed.
    pub installed_version: String,
    pub created_at: String,
}

impl Instance {
    pub fn install_dir(&self) -> PathBuf {
        self.working_dir.join("install")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.working_dir.join("backups")
    }

    pub fn saves_dir(&self) -> PathBuf {
        self.working_dir.join("saves")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.working_dir.join("temp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.working_dir.join("logs")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.working_dir.join("config")
    }

    /// Every derived directory, keyed by its record field name.
    pub fn derived_dirs(&self) -> Vec<(&'static str, PathBuf)> {
        DERIVED_DIRS
            .iter()
            .map(|(key, sub)| (*key, self.working_dir.join(sub)))
            .collect()
    }

    /// PID file used by the standalone backend.
    pub fn pid_file(&self) -> PathBuf {
        self.working_dir.join(format!(".{}.pid", self.name))
    }

    /// Staging directory for a downloaded version.
    pub fn staging_dir(&self, version: &str) -> PathBuf {
        self.temp_dir().join(format!("{}.staging", version))
    }

    pub fn is_installed(&self) -> bool {
        !self.installed_version.is_empty() && self.installed_version != "0"
    }

    pub(crate) fn to_record(&self) -> KvRecord {
        let mut record = KvRecord::new();
        record.set("name", &self.name);
        record.set("blueprint", &self.blueprint);
        record.set("blueprint_file", self.blueprint_file.display().to_string());
        record.set("working_dir", self.working_dir.display().to_string());
        record.set("lifecycle_manager", self.lifecycle_manager.as_str());
        record.set("installed_version", &self.installed_version);
        record.set("created_at", &self.created_at);
        for (key, path) in self.derived_dirs() {
            record.set(key, path.display().to_string());
        }
        record
    }

    /// Build an instance from its record, rejecting relative or drifted paths.
    pub(crate) fn from_record(record: &KvRecord, record_path: &Path) -> Result<Self> {
        let origin = record_path.display().to_string();
        let required = |key: &str| {
            record
                .get_non_empty(key)
                .ok_or_else(|| AppError::invalid_record(&origin, format!("missing key {}", key)))
        };
        let absolute = |key: &str, value: &str| -> Result<PathBuf> {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                Ok(path)
            } else {
                Err(AppError::invalid_record(
                    &origin,
                    format!("{} is not absolute: {}", key, value),
                ))
            }
        };

        let working_dir = absolute("working_dir", required("working_dir")?)?;
        let lifecycle_manager = required("lifecycle_manager")?
            .parse::<LifecycleManager>()
            .map_err(|e| AppError::invalid_record(&origin, e.to_string()))?;
        let blueprint_file = match record.get_non_empty("blueprint_file") {
            Some(value) => absolute("blueprint_file", value)?,
            None => PathBuf::new(),
        };

        let instance = Self {
            name: required("name")?.to_string(),
            blueprint: required("blueprint")?.to_string(),
            blueprint_file,
            working_dir,
            lifecycle_manager,
            installed_version: record.get("installed_version").unwrap_or("").to_string(),
            created_at: record.get("created_at").unwrap_or("").to_string(),
        };

        for (key, expected) in instance.derived_dirs() {
            if let Some(value) = record.get_non_empty(key) {
                let stored = absolute(key, value)?;
                if stored != expected {
                    return Err(AppError::invalid_record(
                        &origin,
                        format!("{} does not match working_dir: {}", key, value),
                    ));
                }
            }
        }

        Ok(instance)
    }
}

/// Status information for an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub blueprint: String,
    pub lifecycle_manager: LifecycleManager,
    pub installed_version: String,
    pub installed: bool,
    pub running: bool,
    pub working_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Instance {
        Instance {
            name: "valheim-1234".into(),
            blueprint: "valheim".into(),
            blueprint_file: PathBuf::from("/srv/gsm/blueprints/valheim.bp"),
            working_dir: PathBuf::from("/srv/games/valheim-1234"),
            lifecycle_manager: LifecycleManager::Systemd,
            installed_version: "0.217.46".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn derived_paths_are_direct_children_of_working_dir() {
        let instance = sample();
        for (_, path) in instance.derived_dirs() {
            assert_eq!(path.parent(), Some(instance.working_dir.as_path()));
        }
        assert_eq!(instance.staging_dir("1.0").parent(), Some(instance.temp_dir().as_path()));
    }

    #[test]
    fn record_round_trip() {
        let instance = sample();
        let back =
            Instance::from_record(&instance.to_record(), Path::new("/r/valheim-1234.ini")).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn relative_working_dir_is_corrupt() {
        let mut record = sample().to_record();
        record.set("working_dir", "games/valheim");
        let err = Instance::from_record(&record, Path::new("/r/x.ini")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn relative_or_drifted_derived_path_is_corrupt() {
        let mut record = sample().to_record();
        record.set("install_dir", "install");
        assert!(Instance::from_record(&record, Path::new("/r/x.ini")).is_err());

        let mut record = sample().to_record();
        record.set("backups_dir", "/mnt/elsewhere/backups");
        assert!(Instance::from_record(&record, Path::new("/r/x.ini")).is_err());
    }

    #[test]
    fn missing_required_key_is_corrupt() {
        let mut record = KvRecord::new();
        record.set("name", "x");
        let err = Instance::from_record(&record, Path::new("/r/x.ini")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn version_zero_means_not_installed() {
        let mut instance = sample();
        assert!(instance.is_installed());
        instance.installed_version = "0".into();
        assert!(!instance.is_installed());
        instance.installed_version.clear();
        assert!(!instance.is_installed());
    }
}
