//! Instance record storage: create, load, version updates and deletion.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;

use super::types::{Instance, LifecycleManager};
use crate::blueprint::Blueprint;
use crate::cache::RecordCache;
use crate::error::{AppError, Result};
use crate::kv::KvRecord;
use crate::paths::{absolute, Layout};
use crate::validation::validate_instance_name;

/// Attempts at picking a free generated name before giving up.
const MAX_NAME_ATTEMPTS: usize = 16;

/// Caller overrides for [`InstanceStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub lifecycle_manager: Option<LifecycleManager>,
}

/// Pick `<blueprint>-<NNNN>` that `taken` does not reject.
pub fn generate_name<R, F>(blueprint: &str, rng: &mut R, taken: F) -> Result<String>
where
    R: Rng,
    F: Fn(&str) -> bool,
{
    for _ in 0..MAX_NAME_ATTEMPTS {
        let candidate = format!("{}-{:04}", blueprint, rng.gen_range(0..10_000));
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(AppError::resource_exhausted(format!(
        "No free instance name for blueprint {} after {} attempts",
        blueprint, MAX_NAME_ATTEMPTS
    )))
}

/// Validated accessor for instance records under `<root>/instances`.
pub struct InstanceStore {
    layout: Layout,
    cache: Arc<RecordCache<Instance>>,
}

impl InstanceStore {
    pub fn new(layout: Layout, cache: Arc<RecordCache<Instance>>) -> Self {
        Self { layout, cache }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.layout.instance_record(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_file()
    }

    /// Names of all instances with a record, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.layout.instances_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| AppError::io(format!("Failed to read {:?}: {}", dir, e)))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ini") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<Arc<Instance>> {
        validate_instance_name(name)?;
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached);
        }

        let path = self.record_path(name);
        if !path.is_file() {
            return Err(AppError::instance_not_found(name));
        }
        let instance = Instance::from_record(&KvRecord::read(&path)?, &path)?;
        if instance.name != name {
            return Err(AppError::invalid_record(
                &path.display().to_string(),
                format!("record names instance {}", instance.name),
            ));
        }

        let instance = Arc::new(instance);
        self.cache.mark_cached(name, &path, Arc::clone(&instance));
        Ok(instance)
    }

    /// Create and persist a new instance record for `blueprint`.
    pub fn create(
        &self,
        blueprint: &Blueprint,
        options: CreateOptions,
        default_manager: LifecycleManager,
        servers_dir: Option<PathBuf>,
    ) -> Result<Arc<Instance>> {
        let name = match options.name {
            Some(name) => {
                validate_instance_name(&name)?;
                if self.exists(&name) {
                    return Err(AppError::invalid_argument(format!(
                        "Instance {} already exists",
                        name
                    )));
                }
                name
            }
            None => {
                let mut rng = rand::thread_rng();
                generate_name(&blueprint.name, &mut rng, |candidate| self.exists(candidate))?
            }
        };

        let working_dir = match options.working_dir {
            Some(dir) => absolute(&dir)?,
            None => {
                let parent = match servers_dir {
                    Some(dir) => absolute(&dir)?,
                    None => self.layout.servers_dir(),
                };
                parent.join(&name)
            }
        };

        let lifecycle_manager = if blueprint.is_container() {
            LifecycleManager::Container
        } else {
            match options.lifecycle_manager.unwrap_or(default_manager) {
                LifecycleManager::Container => {
                    return Err(AppError::invalid_argument(format!(
                        "Blueprint {} is not container based",
                        blueprint.name
                    )))
                }
                other => other,
            }
        };

        let instance = Instance {
            name,
            blueprint: blueprint.name.clone(),
            blueprint_file: absolute(&blueprint.file)?,
            working_dir,
            lifecycle_manager,
            installed_version: String::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.save(&instance)?;
        log::info!(
            "Created instance {} from blueprint {}",
            instance.name,
            instance.blueprint
        );
        self.load(&instance.name)
    }

    fn save(&self, instance: &Instance) -> Result<()> {
        let path = self.record_path(&instance.name);
        instance.to_record().write(&path)?;
        self.cache.clear(&instance.name);
        Ok(())
    }

    /// Persist a new installed version and return the refreshed instance.
    pub fn set_version(&self, instance: &Instance, version: &str) -> Result<Arc<Instance>> {
        let mut updated = instance.clone();
        updated.installed_version = version.to_string();
        self.save(&updated)?;
        self.load(&updated.name)
    }

    /// Delete an instance record. Returns `false` when it was already gone.
    pub fn delete(&self, name: &str) -> Result<bool> {
        validate_instance_name(name)?;
        self.cache.clear(name);
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::io(format!("Failed to remove {:?}: {}", path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{BlueprintKind, BlueprintSource, NativeSpec};

    fn blueprint(dir: &std::path::Path) -> Blueprint {
        Blueprint {
            name: "terraria".into(),
            display_name: "Terraria".into(),
            file: dir.join("terraria.bp"),
            kind: BlueprintKind::Native(NativeSpec {
                executable_file: Some("TerrariaServer.bin.x86_64".into()),
                executable_subdirectory: None,
                executable_arguments: None,
            }),
            ports: "7777/tcp".into(),
            source: BlueprintSource::default(),
        }
    }

    fn store(root: &std::path::Path) -> InstanceStore {
        InstanceStore::new(Layout::new(root), Arc::new(RecordCache::new()))
    }

    #[test]
    fn create_load_and_set_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let bp = blueprint(tmp.path());

        let created = store
            .create(&bp, CreateOptions::default(), LifecycleManager::Standalone, None)
            .unwrap();
        assert!(created.name.starts_with("terraria-"));
        assert_eq!(
            created.working_dir,
            tmp.path().join("servers").join(&created.name)
        );
        assert!(!created.is_installed());
        assert_eq!(store.list().unwrap(), vec![created.name.clone()]);

        let updated = store.set_version(&created, "1.4.4.9").unwrap();
        assert_eq!(updated.installed_version, "1.4.4.9");
        assert_eq!(
            store.load(&created.name).unwrap().installed_version,
            "1.4.4.9"
        );
    }

    #[test]
    fn explicit_duplicate_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let bp = blueprint(tmp.path());
        let options = CreateOptions {
            name: Some("tt".into()),
            ..CreateOptions::default()
        };
        store
            .create(&bp, options.clone(), LifecycleManager::Standalone, None)
            .unwrap();
        let err = store
            .create(&bp, options, LifecycleManager::Standalone, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn name_generation_gives_up_permanently() {
        let mut rng = rand::thread_rng();
        let err = generate_name("rust", &mut rng, |_| true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);

        let name = generate_name("rust", &mut rng, |_| false).unwrap();
        assert!(name.starts_with("rust-"));
        assert_eq!(name.len(), "rust-".len() + 4);
    }

    #[test]
    fn native_blueprint_cannot_use_container_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let options = CreateOptions {
            lifecycle_manager: Some(LifecycleManager::Container),
            ..CreateOptions::default()
        };
        let err = store(tmp.path())
            .create(&blueprint(tmp.path()), options, LifecycleManager::Systemd, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn corrupt_record_is_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        fs::create_dir_all(tmp.path().join("instances")).unwrap();
        fs::write(
            tmp.path().join("instances/bad.ini"),
            "name=\"bad\"\nblueprint=\"x\"\nworking_dir=\"relative/dir\"\nlifecycle_manager=\"standalone\"\n",
        )
        .unwrap();
        let err = store.load("bad").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let created = store
            .create(
                &blueprint(tmp.path()),
                CreateOptions::default(),
                LifecycleManager::Standalone,
                None,
            )
            .unwrap();
        assert!(store.delete(&created.name).unwrap());
        assert!(!store.delete(&created.name).unwrap());
        assert_eq!(
            store.load(&created.name).unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }
}
