//! OS-level resources owned by an instance.
//!
//! Directories are handled natively. Everything rendered from templates
//! (management script, supervision unit, firewall rule, shortcut) is delegated
//! to hook commands from `[provisioning]`; an unset hook is a no-op.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;

use crate::config::ProvisioningConfig;
use crate::error::{AppError, ErrorKind, Result};
use crate::instance::{Instance, LifecycleManager};
use crate::paths::Layout;
use crate::process::{failure_detail, run_tool, shell};

/// Every call is safe to repeat after a partial failure.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_directories(&self, instance: &Instance) -> Result<()>;
    async fn remove_directories(&self, instance: &Instance) -> Result<()>;
    async fn create_management_script(&self, instance: &Instance) -> Result<()>;
    /// Refuses to replace an existing unit unless `overwrite` is set.
    async fn create_supervision_unit(&self, instance: &Instance, overwrite: bool) -> Result<()>;
    async fn remove_supervision_unit(&self, instance: &Instance) -> Result<()>;
    async fn create_firewall_rule(&self, instance: &Instance, ports: &str) -> Result<()>;
    async fn remove_firewall_rule(&self, instance: &Instance, ports: &str) -> Result<()>;
    async fn create_shortcut(&self, instance: &Instance) -> Result<()>;
    async fn remove_shortcut(&self, instance: &Instance) -> Result<()>;
}

pub struct HostProvisioner {
    config: ProvisioningConfig,
    layout: Layout,
}

impl HostProvisioner {
    pub fn new(config: ProvisioningConfig, layout: Layout) -> Self {
        Self { config, layout }
    }

    async fn run_hook(
        &self,
        hook: &str,
        script: Option<&str>,
        instance: &Instance,
        extra_env: &[(&str, &str)],
        failure_kind: ErrorKind,
    ) -> Result<()> {
        let Some(script) = script.filter(|s| !s.trim().is_empty()) else {
            log::debug!("No {} hook configured, skipping for {}", hook, instance.name);
            return Ok(());
        };

        let mut cmd = shell(script, Some(self.layout.root()));
        cmd.env("GSM_HOOK", hook)
            .env("GSM_INSTANCE", &instance.name)
            .env("GSM_BLUEPRINT", &instance.blueprint)
            .env("GSM_RECORD", self.layout.instance_record(&instance.name))
            .env("GSM_WORKING_DIR", &instance.working_dir)
            .env("GSM_INSTALL_DIR", instance.install_dir())
            .env("GSM_LIFECYCLE_MANAGER", instance.lifecycle_manager.as_str());
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        let output = run_tool(&mut cmd, "sh").await?;
        if output.status.success() {
            log::debug!("{} hook succeeded for {}", hook, instance.name);
            return Ok(());
        }
        Err(AppError::new(
            failure_kind,
            BTreeMap::from([
                ("instance".to_string(), instance.name.clone()),
                (
                    "detail".to_string(),
                    format!("{} hook failed: {}", hook, failure_detail(&output)),
                ),
            ]),
        ))
    }

    fn unit_exists(&self, instance: &Instance) -> bool {
        self.config
            .supervision_unit_dir
            .as_deref()
            .is_some_and(|dir| dir.join(format!("{}.service", instance.name)).exists())
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
            AppError::permission_denied(format!("Failed to remove {:?}: {}", dir, e)),
        ),
        Err(e) => Err(AppError::io(format!("Failed to remove {:?}: {}", dir, e))),
    }
}

#[async_trait]
impl Provisioner for HostProvisioner {
    async fn create_directories(&self, instance: &Instance) -> Result<()> {
        fs::create_dir_all(&instance.working_dir).map_err(|e| {
            AppError::io(format!("Failed to create {:?}: {}", instance.working_dir, e))
        })?;
        for (_, dir) in instance.derived_dirs() {
            fs::create_dir_all(&dir)
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    async fn remove_directories(&self, instance: &Instance) -> Result<()> {
        let dir = &instance.working_dir;
        if dir.parent().is_none() || dir == self.layout.root() {
            return Err(AppError::invalid_config(format!(
                "Refusing to remove {:?}",
                dir
            )));
        }
        if remove_dir_if_present(dir)? {
            log::info!("Removed {:?}", dir);
        }
        Ok(())
    }

    async fn create_management_script(&self, instance: &Instance) -> Result<()> {
        self.run_hook(
            "management_script",
            self.config.management_script.as_deref(),
            instance,
            &[],
            ErrorKind::Other,
        )
        .await
    }

    async fn create_supervision_unit(&self, instance: &Instance, overwrite: bool) -> Result<()> {
        if instance.lifecycle_manager != LifecycleManager::Systemd {
            return Ok(());
        }
        if !overwrite && self.unit_exists(instance) {
            return Err(AppError::not_empty(&format!("{}.service", instance.name)));
        }
        self.run_hook(
            "supervision_unit_create",
            self.config.supervision_unit_create.as_deref(),
            instance,
            &[("GSM_OVERWRITE", if overwrite { "1" } else { "0" })],
            ErrorKind::Supervision,
        )
        .await
    }

    async fn remove_supervision_unit(&self, instance: &Instance) -> Result<()> {
        if instance.lifecycle_manager != LifecycleManager::Systemd {
            return Ok(());
        }
        self.run_hook(
            "supervision_unit_remove",
            self.config.supervision_unit_remove.as_deref(),
            instance,
            &[],
            ErrorKind::Supervision,
        )
        .await
    }

    async fn create_firewall_rule(&self, instance: &Instance, ports: &str) -> Result<()> {
        self.run_hook(
            "firewall_create",
            self.config.firewall_create.as_deref(),
            instance,
            &[("GSM_PORTS", ports)],
            ErrorKind::Other,
        )
        .await
    }

    async fn remove_firewall_rule(&self, instance: &Instance, ports: &str) -> Result<()> {
        self.run_hook(
            "firewall_remove",
            self.config.firewall_remove.as_deref(),
            instance,
            &[("GSM_PORTS", ports)],
            ErrorKind::Other,
        )
        .await
    }

    async fn create_shortcut(&self, instance: &Instance) -> Result<()> {
        self.run_hook(
            "shortcut_create",
            self.config.shortcut_create.as_deref(),
            instance,
            &[],
            ErrorKind::Other,
        )
        .await
    }

    async fn remove_shortcut(&self, instance: &Instance) -> Result<()> {
        self.run_hook(
            "shortcut_remove",
            self.config.shortcut_remove.as_deref(),
            instance,
            &[],
            ErrorKind::Other,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn instance(root: &Path, manager: LifecycleManager) -> Instance {
        Instance {
            name: "ark-0042".into(),
            blueprint: "ark".into(),
            blueprint_file: PathBuf::new(),
            working_dir: root.join("servers/ark-0042"),
            lifecycle_manager: manager,
            installed_version: String::new(),
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn remove_directories_twice_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner =
            HostProvisioner::new(ProvisioningConfig::default(), Layout::new(tmp.path()));
        let instance = instance(tmp.path(), LifecycleManager::Standalone);

        provisioner.create_directories(&instance).await.unwrap();
        for (_, dir) in instance.derived_dirs() {
            assert!(dir.is_dir());
        }

        provisioner.remove_directories(&instance).await.unwrap();
        assert!(!instance.working_dir.exists());
        provisioner.remove_directories(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn unset_hooks_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner =
            HostProvisioner::new(ProvisioningConfig::default(), Layout::new(tmp.path()));
        let instance = instance(tmp.path(), LifecycleManager::Systemd);
        provisioner.create_management_script(&instance).await.unwrap();
        provisioner
            .create_supervision_unit(&instance, false)
            .await
            .unwrap();
        provisioner
            .create_firewall_rule(&instance, "7777/udp")
            .await
            .unwrap();
        provisioner.remove_shortcut(&instance).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn firewall_hook_receives_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("ports.txt");
        let config = ProvisioningConfig {
            firewall_create: Some(format!(
                "printf '%s %s' \"$GSM_INSTANCE\" \"$GSM_PORTS\" > {}",
                out.display()
            )),
            ..ProvisioningConfig::default()
        };
        let provisioner = HostProvisioner::new(config, Layout::new(tmp.path()));
        provisioner
            .create_firewall_rule(
                &instance(tmp.path(), LifecycleManager::Standalone),
                "27015:27016/udp|27015/tcp",
            )
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(out).unwrap(),
            "ark-0042 27015:27016/udp|27015/tcp"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_hook_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ProvisioningConfig {
            supervision_unit_create: Some("echo no unit for you >&2; exit 1".into()),
            ..ProvisioningConfig::default()
        };
        let provisioner = HostProvisioner::new(config, Layout::new(tmp.path()));
        let err = provisioner
            .create_supervision_unit(&instance(tmp.path(), LifecycleManager::Systemd), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Supervision);
        assert!(err.to_string().contains("no unit for you"));
    }

    #[tokio::test]
    async fn existing_unit_requires_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let unit_dir = tmp.path().join("units");
        fs::create_dir_all(&unit_dir).unwrap();
        fs::write(unit_dir.join("ark-0042.service"), "[Unit]\n").unwrap();
        let config = ProvisioningConfig {
            supervision_unit_dir: Some(unit_dir),
            ..ProvisioningConfig::default()
        };
        let provisioner = HostProvisioner::new(config, Layout::new(tmp.path()));
        let instance = instance(tmp.path(), LifecycleManager::Systemd);

        let err = provisioner
            .create_supervision_unit(&instance, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEmpty);
        provisioner
            .create_supervision_unit(&instance, true)
            .await
            .unwrap();
    }
}
