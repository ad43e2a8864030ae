//! Read-only blueprint templates.
//!
//! Native blueprints are `<name>.bp` key/value files; container blueprints are
//! `<name>.docker-compose.yml` (or `.yaml`) descriptors with an optional
//! `x-gsm` block carrying version/download identity.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::cache::RecordCache;
use crate::error::{AppError, Result};
use crate::kv::KvRecord;
use crate::ports::{compose_to_firewall_ports, extract_blueprint_name};
use crate::validation::validate_blueprint_name;

/// Where a blueprint's versions come from and how they are fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintSource {
    #[serde(default)]
    pub github_repo: Option<String>,
    #[serde(default)]
    pub version_command: Option<String>,
    #[serde(default)]
    pub download_command: Option<String>,
    /// URL template; `{version}` is substituted.
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSpec {
    pub executable_file: Option<String>,
    pub executable_subdirectory: Option<String>,
    pub executable_arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Raw compose descriptor text.
    pub descriptor: String,
    /// Image reference of the first service, if any.
    pub image: Option<String>,
}

impl ContainerSpec {
    /// Tag portion of the first image reference (`latest` when untagged).
    pub fn image_tag(&self) -> Option<String> {
        let image = self.image.as_deref()?;
        let image = image.split('@').next().unwrap_or(image);
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        Some(
            last_segment
                .split_once(':')
                .map(|(_, tag)| tag.to_string())
                .unwrap_or_else(|| "latest".to_string()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlueprintKind {
    Native(NativeSpec),
    Container(ContainerSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    pub name: String,
    pub display_name: String,
    pub file: PathBuf,
    pub kind: BlueprintKind,
    /// Firewall port string (`25565/tcp|27015`).
    pub ports: String,
    pub source: BlueprintSource,
}

impl Blueprint {
    pub fn is_container(&self) -> bool {
        matches!(self.kind, BlueprintKind::Container(_))
    }

    fn from_native(path: &Path, record: &KvRecord) -> Self {
        let name = extract_blueprint_name(&path.display().to_string());
        let owned = |key: &str| record.get_non_empty(key).map(str::to_string);
        Self {
            display_name: owned("name").unwrap_or_else(|| name.clone()),
            name,
            file: path.to_path_buf(),
            kind: BlueprintKind::Native(NativeSpec {
                executable_file: owned("executable_file"),
                executable_subdirectory: owned("executable_subdirectory"),
                executable_arguments: owned("executable_arguments"),
            }),
            ports: owned("ports").unwrap_or_default(),
            source: BlueprintSource {
                github_repo: owned("github_repo"),
                version_command: owned("version_command"),
                download_command: owned("download_command"),
                download_url: owned("download_url"),
            },
        }
    }

    fn from_container(path: &Path, descriptor: String) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(&descriptor).map_err(|e| {
            AppError::invalid_record(&path.display().to_string(), e.to_string())
        })?;

        let source = match doc.get("x-gsm") {
            Some(ext) => serde_yaml::from_value(ext.clone()).map_err(|e| {
                AppError::invalid_record(&path.display().to_string(), e.to_string())
            })?,
            None => BlueprintSource::default(),
        };

        let image = doc
            .get("services")
            .and_then(Value::as_mapping)
            .and_then(|services| services.values().find_map(|s| s.get("image")))
            .and_then(Value::as_str)
            .map(str::to_string);

        let name = extract_blueprint_name(&path.display().to_string());
        Ok(Self {
            display_name: name.clone(),
            name,
            file: path.to_path_buf(),
            ports: compose_to_firewall_ports(&descriptor),
            kind: BlueprintKind::Container(ContainerSpec { descriptor, image }),
            source,
        })
    }
}

/// Blueprint lookup over a directory of template files.
pub struct BlueprintStore {
    dir: PathBuf,
    cache: Arc<RecordCache<Blueprint>>,
}

impl BlueprintStore {
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<RecordCache<Blueprint>>) -> Self {
        Self {
            dir: dir.into(),
            cache,
        }
    }

    fn candidates(&self, name: &str) -> [PathBuf; 3] {
        [
            self.dir.join(format!("{}.bp", name)),
            self.dir.join(format!("{}.docker-compose.yml", name)),
            self.dir.join(format!("{}.docker-compose.yaml", name)),
        ]
    }

    /// Path of the blueprint file backing `name`.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        validate_blueprint_name(name)?;
        self.candidates(name)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| AppError::blueprint_not_found(name))
    }

    pub fn load(&self, name: &str) -> Result<Arc<Blueprint>> {
        let name = extract_blueprint_name(name);
        if let Some(cached) = self.cache.get(&name) {
            return Ok(cached);
        }

        let path = self.locate(&name)?;
        let blueprint = if path.extension().and_then(|e| e.to_str()) == Some("bp") {
            Blueprint::from_native(&path, &KvRecord::read(&path)?)
        } else {
            let descriptor = fs::read_to_string(&path)
                .map_err(|e| AppError::io(format!("Failed to read {:?}: {}", path, e)))?;
            Blueprint::from_container(&path, descriptor)?
        };

        let blueprint = Arc::new(blueprint);
        self.cache.mark_cached(&name, &path, Arc::clone(&blueprint));
        Ok(blueprint)
    }

    /// Names of every blueprint file in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .map_err(|e| AppError::io(format!("Failed to read {:?}: {}", self.dir, e)))?
        {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = extract_blueprint_name(file_name);
            if name != file_name && !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> BlueprintStore {
        BlueprintStore::new(dir, Arc::new(RecordCache::new()))
    }

    #[test]
    fn loads_native_blueprint() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("factorio.bp"),
            "name=\"Factorio\"\nports=\"34197/udp\"\nexecutable_file=\"factorio\"\nexecutable_subdirectory=\"bin/x64\"\ngithub_repo=\"wube/factorio\"\n",
        )
        .unwrap();

        let bp = store(tmp.path()).load("factorio").unwrap();
        assert_eq!(bp.name, "factorio");
        assert_eq!(bp.display_name, "Factorio");
        assert_eq!(bp.ports, "34197/udp");
        assert_eq!(bp.source.github_repo.as_deref(), Some("wube/factorio"));
        let BlueprintKind::Native(spec) = &bp.kind else {
            unreachable!("expected a native blueprint");
        };
        assert_eq!(spec.executable_file.as_deref(), Some("factorio"));
        assert_eq!(spec.executable_subdirectory.as_deref(), Some("bin/x64"));
    }

    #[test]
    fn loads_container_blueprint_with_extension_block() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("minecraft.docker-compose.yml"),
            "x-gsm:\n  download_url: \"https://example.invalid/{version}.tar.gz\"\nservices:\n  mc:\n    image: itzg/minecraft-server:2024.6.1\n    ports:\n      - \"25565:25565/tcp\"\n",
        )
        .unwrap();

        let bp = store(tmp.path())
            .load("/anywhere/minecraft.docker-compose.yml")
            .unwrap();
        assert!(bp.is_container());
        assert_eq!(bp.ports, "25565:25565/tcp");
        assert_eq!(
            bp.source.download_url.as_deref(),
            Some("https://example.invalid/{version}.tar.gz")
        );
        let BlueprintKind::Container(spec) = &bp.kind else {
            unreachable!("expected a container blueprint");
        };
        assert_eq!(spec.image_tag().as_deref(), Some("2024.6.1"));
    }

    #[test]
    fn image_tag_defaults_to_latest() {
        let spec = ContainerSpec {
            descriptor: String::new(),
            image: Some("registry.local:5000/games/valheim".into()),
        };
        assert_eq!(spec.image_tag().as_deref(), Some("latest"));
    }

    #[test]
    fn missing_blueprint_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = store(tmp.path()).load("nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn list_deduplicates_and_skips_unrelated_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.bp"), "").unwrap();
        fs::write(tmp.path().join("b.docker-compose.yml"), "services: {}\n").unwrap();
        fs::write(tmp.path().join("README"), "").unwrap();
        assert_eq!(store(tmp.path()).list().unwrap(), vec!["a", "b"]);
    }
}
