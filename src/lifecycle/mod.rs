//! Instance lifecycle orchestration.
//!
//! States per instance: absent, provisioned (stopped) and running. Mutating
//! workflows (install, update, backup, restore, uninstall) hold the
//! instance's advisory lock for their whole duration; start and stop only
//! delegate to the supervision backend.

mod backup;
mod fsops;
mod update;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::blueprint::{Blueprint, BlueprintStore};
use crate::cache::RecordCache;
use crate::config::{AppConfig, InstancesConfig};
use crate::download::{BlueprintDownloader, Downloader};
use crate::error::{AppError, Result};
use crate::events::{payload, EventBus, EventKind};
use crate::instance::{CreateOptions, Instance, InstanceStatus, InstanceStore};
use crate::lock::InstanceLock;
use crate::paths::{is_dir_empty, Layout};
use crate::ports::firewall_to_router_ports;
use crate::process::{Supervision, Supervisor};
use crate::provision::{HostProvisioner, Provisioner};
use crate::version::{http_client, BlueprintVersionSource, VersionSource};

pub use backup::{list_backups, parse_backup_name, BackupInfo, BACKUP_SUFFIX};
pub use update::{UninstallOutcome, UpdateOutcome, DOWNLOAD_MARKER};

/// Collaborators and stores the orchestrator is assembled from.
pub struct OrchestratorParts {
    pub layout: Layout,
    pub blueprints: Arc<BlueprintStore>,
    pub instances: InstanceStore,
    pub events: EventBus,
    pub supervisor: Arc<dyn Supervisor>,
    pub versions: Arc<dyn VersionSource>,
    pub downloader: Arc<dyn Downloader>,
    pub provisioner: Arc<dyn Provisioner>,
    pub defaults: InstancesConfig,
}

pub struct Orchestrator {
    layout: Layout,
    blueprints: Arc<BlueprintStore>,
    instances: InstanceStore,
    events: EventBus,
    supervisor: Arc<dyn Supervisor>,
    versions: Arc<dyn VersionSource>,
    downloader: Arc<dyn Downloader>,
    provisioner: Arc<dyn Provisioner>,
    defaults: InstancesConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub backup: String,
    pub version: String,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            layout: parts.layout,
            blueprints: parts.blueprints,
            instances: parts.instances,
            events: parts.events,
            supervisor: parts.supervisor,
            versions: parts.versions,
            downloader: parts.downloader,
            provisioner: parts.provisioner,
            defaults: parts.defaults,
        }
    }

    /// Wire the production collaborators for `layout` and `config`.
    pub fn from_config(layout: Layout, config: &AppConfig) -> Result<Self> {
        let blueprints = Arc::new(BlueprintStore::new(
            layout.blueprints_dir(),
            Arc::new(RecordCache::new()),
        ));
        let client = http_client()?;
        Ok(Self::new(OrchestratorParts {
            instances: InstanceStore::new(layout.clone(), Arc::new(RecordCache::new())),
            events: EventBus::from_config(&config.events, &layout),
            supervisor: Arc::new(Supervision::new(Arc::clone(&blueprints))),
            versions: Arc::new(BlueprintVersionSource::new(client.clone())),
            downloader: Arc::new(BlueprintDownloader::new(client)),
            provisioner: Arc::new(HostProvisioner::new(
                config.provisioning.clone(),
                layout.clone(),
            )),
            defaults: config.instances.clone(),
            blueprints,
            layout,
        }))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn blueprints(&self) -> &BlueprintStore {
        &self.blueprints
    }

    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock(&self, name: &str) -> Result<InstanceLock> {
        InstanceLock::acquire(&self.layout.instance_lock(name), name)
    }

    fn load_with_blueprint(&self, name: &str) -> Result<(Arc<Instance>, Arc<Blueprint>)> {
        let instance = self.instances.load(name)?;
        let blueprint = self.blueprints.load(&instance.blueprint)?;
        Ok((instance, blueprint))
    }

    async fn emit(&self, kind: EventKind, instance: &str, data: BTreeMap<String, String>) {
        self.events.emit(kind, instance, data).await;
    }

    /// Create an instance record from a blueprint. Nothing is provisioned yet.
    pub async fn create(&self, blueprint: &str, options: CreateOptions) -> Result<Arc<Instance>> {
        let blueprint = self.blueprints.load(blueprint)?;
        let instance = self.instances.create(
            &blueprint,
            options,
            self.defaults.default_lifecycle_manager,
            self.defaults.servers_dir.clone(),
        )?;
        self.emit(
            EventKind::InstanceCreated,
            &instance.name,
            payload([
                ("blueprint", blueprint.name.as_str()),
                ("working_dir", &instance.working_dir.display().to_string()),
                ("lifecycle_manager", instance.lifecycle_manager.as_str()),
            ]),
        )
        .await;
        Ok(instance)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let instance = self.instances.load(name)?;
        if !instance.is_installed() {
            return Err(AppError::invalid_argument(format!(
                "Instance {} is not installed",
                name
            )));
        }
        if self.supervisor.is_active(&instance).await? {
            return Err(AppError::instance_running(name));
        }
        self.supervisor.start(&instance).await?;
        log::info!("Started {}", name);
        self.emit(EventKind::InstanceStarted, name, payload([])).await;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let instance = self.instances.load(name)?;
        if !self.supervisor.is_active(&instance).await? {
            return Err(AppError::instance_not_running(name));
        }
        self.supervisor.stop(&instance).await?;
        log::info!("Stopped {}", name);
        self.emit(EventKind::InstanceStopped, name, payload([])).await;
        Ok(())
    }

    /// Stop if running, then start.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let instance = self.instances.load(name)?;
        if self.supervisor.is_active(&instance).await? {
            self.supervisor.stop(&instance).await?;
            self.emit(EventKind::InstanceStopped, name, payload([])).await;
        }
        self.start(name).await
    }

    pub async fn status(&self, name: &str) -> Result<InstanceStatus> {
        let instance = self.instances.load(name)?;
        let running = self.supervisor.is_active(&instance).await?;
        Ok(status_of(&instance, running))
    }

    /// Status of every instance. Backend probe failures read as not running.
    pub async fn list(&self) -> Result<Vec<InstanceStatus>> {
        let mut statuses = Vec::new();
        for name in self.instances.list()? {
            let instance = match self.instances.load(&name) {
                Ok(instance) => instance,
                Err(e) => {
                    log::warn!("Skipping instance {}: {}", name, e);
                    continue;
                }
            };
            let running = match self.supervisor.is_active(&instance).await {
                Ok(running) => running,
                Err(e) => {
                    log::warn!("Cannot query {}: {}", name, e);
                    false
                }
            };
            statuses.push(status_of(&instance, running));
        }
        Ok(statuses)
    }

    /// Firewall port string of the instance's blueprint.
    pub fn firewall_ports(&self, name: &str) -> Result<String> {
        let (_, blueprint) = self.load_with_blueprint(name)?;
        Ok(blueprint.ports.clone())
    }

    /// One `"<port> <protocol>"` line per forwarded port.
    pub fn router_ports(&self, name: &str) -> Result<Vec<String>> {
        let ports = self.firewall_ports(name)?;
        firewall_to_router_ports(&ports).map_err(|e| {
            AppError::invalid_config(format!("Blueprint ports of {}: {}", name, e))
        })
    }

    pub fn list_backups(&self, name: &str) -> Result<Vec<BackupInfo>> {
        let instance = self.instances.load(name)?;
        list_backups(&instance)
    }

    /// Move the install directory into a new backup. The instance must be stopped.
    pub async fn backup(&self, name: &str) -> Result<Option<BackupInfo>> {
        let _lock = self.lock(name)?;
        let instance = self.instances.load(name)?;
        if self.supervisor.is_active(&instance).await? {
            return Err(AppError::instance_running(name));
        }
        self.backup_locked(&instance).await
    }

    async fn backup_locked(&self, instance: &Instance) -> Result<Option<BackupInfo>> {
        if is_dir_empty(&instance.install_dir())? {
            log::info!("Install directory of {} is empty, no backup needed", instance.name);
            return Ok(None);
        }
        self.emit(EventKind::InstanceBackupStarted, &instance.name, payload([]))
            .await;
        let Some(info) = backup::create_backup(instance)? else {
            return Ok(None);
        };
        if let Err(e) = self.instances.set_version(instance, "0") {
            log::warn!(
                "Backup of {} created but version marker not reset: {}",
                instance.name,
                e
            );
        }
        self.emit(
            EventKind::InstanceBackupCreated,
            &instance.name,
            payload([("backup", info.id.as_str()), ("version", &info.version)]),
        )
        .await;
        Ok(Some(info))
    }

    /// Restore a backup (newest when `backup_id` is `None`). The instance must
    /// be stopped; a non-empty install directory needs `overwrite`.
    pub async fn restore(
        &self,
        name: &str,
        backup_id: Option<&str>,
        overwrite: bool,
    ) -> Result<RestoreOutcome> {
        let _lock = self.lock(name)?;
        let instance = self.instances.load(name)?;
        if self.supervisor.is_active(&instance).await? {
            return Err(AppError::instance_running(name));
        }

        let info = backup::find_backup(&instance, backup_id)?;
        backup::restore_backup(&instance, &info, overwrite)?;
        self.instances.set_version(&instance, &info.version)?;
        log::info!("Restored {} from {}", name, info.id);

        self.emit(
            EventKind::InstanceBackupRestored,
            name,
            payload([("backup", info.id.as_str()), ("version", &info.version)]),
        )
        .await;
        Ok(RestoreOutcome {
            backup: info.id,
            version: info.version,
        })
    }
}

fn status_of(instance: &Instance, running: bool) -> InstanceStatus {
    InstanceStatus {
        name: instance.name.clone(),
        blueprint: instance.blueprint.clone(),
        lifecycle_manager: instance.lifecycle_manager,
        installed_version: instance.installed_version.clone(),
        installed: instance.is_installed(),
        running,
        working_dir: instance.working_dir.display().to_string(),
    }
}

