use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::instance::LifecycleManager;

/// Owns the on-disk global config and a cached parsed copy.
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    cache: RwLock<Option<Arc<AppConfig>>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_disk(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            return Ok(AppConfig::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::invalid_config(format!("{:?}: {}", self.path, e)))?;
        toml::from_str(&content)
            .map_err(|e| AppError::invalid_config(format!("{:?}: {}", self.path, e)))
    }

    fn save_to_disk(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.path, content)
            .map_err(|e| AppError::io(format!("Failed to write {:?}: {}", self.path, e)))
    }

    pub fn load(&self) -> Result<Arc<AppConfig>> {
        let cached = {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            cache.as_ref().map(Arc::clone)
        };
        if let Some(config) = cached {
            return Ok(config);
        }

        let config = Arc::new(self.load_from_disk()?);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Execute a read-modify-write operation on the config file while holding a lock.
    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AppConfig) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.load()?;

        let mut updated = (*current).clone();
        let result = f(&mut updated)?;
        self.save_to_disk(&updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(updated));

        Ok(result)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub instances: InstancesConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to `<root>/events.sock` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secondary_url: String,
    /// Shared secret for the HMAC-SHA256 signature header. Empty disables signing.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_webhook_retries")]
    pub retries: u32,
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_webhook_retries() -> u32 {
    2
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            secondary_url: String::new(),
            secret: String::new(),
            timeout_secs: default_webhook_timeout(),
            retries: default_webhook_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    #[serde(default = "default_lifecycle_manager")]
    pub default_lifecycle_manager: LifecycleManager,
    /// Parent directory for new working directories. Defaults to `<root>/servers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_dir: Option<PathBuf>,
}

fn default_lifecycle_manager() -> LifecycleManager {
    LifecycleManager::Standalone
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            default_lifecycle_manager: default_lifecycle_manager(),
            servers_dir: None,
        }
    }
}

/// External commands that render and install OS-level artifacts.
///
/// Every hook is optional; an unset hook is skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervision_unit_create: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervision_unit_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_create: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_create: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_remove: Option<String>,
    /// Directory holding supervision unit files, used to detect existing units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervision_unit_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(tmp.path().join("config.toml"));
        let config = store.load().unwrap();
        assert!(!config.events.socket.enabled);
        assert_eq!(config.events.webhook.timeout_secs, 10);
        assert_eq!(config.events.webhook.retries, 2);
        assert_eq!(
            config.instances.default_lifecycle_manager,
            LifecycleManager::Standalone
        );
    }

    #[test]
    fn update_persists_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let store = ConfigStore::new(&path);
        store
            .update(|config| {
                config.events.webhook.enabled = true;
                config.events.webhook.url = "http://127.0.0.1:9/hook".into();
                Ok(())
            })
            .unwrap();

        let reopened = ConfigStore::new(&path);
        let config = reopened.load().unwrap();
        assert!(config.events.webhook.enabled);
        assert_eq!(config.events.webhook.url, "http://127.0.0.1:9/hook");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "[events.webhook]\nenabled = true\nurl = \"http://example.invalid\"\n",
        )
        .unwrap();
        let config = ConfigStore::new(&path).load().unwrap();
        assert!(config.events.webhook.enabled);
        assert_eq!(config.events.webhook.retries, 2);
        assert!(config.provisioning.firewall_create.is_none());
    }
}
