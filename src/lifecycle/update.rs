//! Install, update and uninstall workflows.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;

use super::backup::BackupInfo;
use super::fsops::move_contents;
use super::Orchestrator;
use crate::blueprint::Blueprint;
use crate::error::{AppError, Result};
use crate::events::{payload, EventKind};
use crate::instance::Instance;
use crate::version::is_downgrade;

/// Written into a staging directory once its download completed.
pub const DOWNLOAD_MARKER: &str = ".download-complete";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate {
        version: String,
    },
    Updated {
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        backup: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UninstallOutcome {
    Removed,
    AlreadyAbsent,
}

fn step_failed(step: &str, error: &AppError) -> BTreeMap<String, String> {
    payload([("step", step), ("error", &error.to_string())])
}

fn move_staged(staging: &Path, install_dir: &Path) -> Result<()> {
    let marker = staging.join(DOWNLOAD_MARKER);
    fs::remove_file(&marker)
        .map_err(|e| AppError::io(format!("Failed to remove {:?}: {}", marker, e)))?;
    fs::create_dir_all(install_dir)
        .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", install_dir, e)))?;
    move_contents(staging, install_dir, &[]).map(drop).map_err(|(e, moved)| {
        log::error!(
            "Moved {} entries into {:?} before failing",
            moved.len(),
            install_dir
        );
        e
    })
}

impl Orchestrator {
    /// Provision every OS resource of a created instance, then deploy the
    /// latest version.
    pub async fn install(&self, name: &str, overwrite_unit: bool) -> Result<UpdateOutcome> {
        let _lock = self.lock(name)?;
        let (instance, blueprint) = self.load_with_blueprint(name)?;
        log::info!("Installing {} ({})", name, blueprint.name);
        self.emit(
            EventKind::InstanceInstallationStarted,
            name,
            payload([("blueprint", blueprint.name.as_str())]),
        )
        .await;

        self.provisioner.create_directories(&instance).await?;
        self.emit(EventKind::InstanceDirectoriesCreated, name, payload([]))
            .await;

        self.provisioner.create_management_script(&instance).await?;
        self.provisioner
            .create_supervision_unit(&instance, overwrite_unit)
            .await?;
        self.provisioner
            .create_firewall_rule(&instance, &blueprint.ports)
            .await?;
        self.provisioner.create_shortcut(&instance).await?;
        self.emit(EventKind::InstanceFilesCreated, name, payload([]))
            .await;

        let outcome = self.update_locked(&instance, &blueprint, true).await?;
        let version = match &outcome {
            UpdateOutcome::UpToDate { version } => version.as_str(),
            UpdateOutcome::Updated { to, .. } => to.as_str(),
        };
        self.emit(
            EventKind::InstanceInstallationFinished,
            name,
            payload([("version", version)]),
        )
        .await;
        self.emit(
            EventKind::InstanceInstalled,
            name,
            payload([("version", version)]),
        )
        .await;
        Ok(outcome)
    }

    /// Bring an installed instance to the latest version of its blueprint.
    ///
    /// The instance ends in the state it started in: running instances are
    /// stopped for the deploy and started again afterwards.
    pub async fn update(&self, name: &str, force: bool) -> Result<UpdateOutcome> {
        let _lock = self.lock(name)?;
        let (instance, blueprint) = self.load_with_blueprint(name)?;
        if !instance.working_dir.is_dir() {
            return Err(AppError::invalid_argument(format!(
                "Instance {} is not installed (missing {:?})",
                name, instance.working_dir
            )));
        }
        self.update_locked(&instance, &blueprint, force).await
    }

    async fn update_locked(
        &self,
        instance: &Instance,
        blueprint: &Blueprint,
        force: bool,
    ) -> Result<UpdateOutcome> {
        let name = instance.name.as_str();
        let from = instance.installed_version.clone();
        self.emit(
            EventKind::InstanceUpdateStarted,
            name,
            payload([("from", from.as_str())]),
        )
        .await;

        let latest = match self.check_version(instance, blueprint, force).await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                log::info!("{} is already up to date ({})", name, from);
                self.emit(
                    EventKind::InstanceUpdateFinished,
                    name,
                    payload([("version", from.as_str()), ("result", "up_to_date")]),
                )
                .await;
                return Ok(UpdateOutcome::UpToDate { version: from });
            }
            Err(e) => return Err(self.fail(name, "version_check", e).await),
        };

        if let Err(e) = self.download(instance, blueprint, &latest).await {
            return Err(self.fail(name, "download", e).await);
        }
        let was_running = self.stop_for_deploy(instance).await?;
        let backup = self.backup_for_deploy(instance, was_running).await?;
        self.deploy(instance, &latest, backup.as_ref()).await?;
        let restart = self.resume(instance, was_running).await;
        self.record_version(instance, &from, &latest).await;
        if let Err(e) = restart {
            return Err(self.fail(name, "start", e).await);
        }

        log::info!("Updated {} from {} to {}", name, from, latest);
        self.emit(
            EventKind::InstanceUpdateFinished,
            name,
            payload([("version", latest.as_str()), ("result", "updated")]),
        )
        .await;
        Ok(UpdateOutcome::Updated {
            from,
            to: latest,
            backup: backup.map(|b| b.id),
        })
    }

    /// Latest version of the blueprint, or `None` when nothing needs deploying.
    async fn check_version(
        &self,
        instance: &Instance,
        blueprint: &Blueprint,
        force: bool,
    ) -> Result<Option<String>> {
        let name = instance.name.as_str();
        self.emit(EventKind::InstanceVersionCheckStarted, name, payload([]))
            .await;
        let latest = self.versions.latest_version(blueprint).await?;
        self.emit(
            EventKind::InstanceVersionCheckFinished,
            name,
            payload([("latest", latest.as_str())]),
        )
        .await;

        let from = instance.installed_version.as_str();
        if instance.is_installed() && from == latest && !force {
            return Ok(None);
        }
        if instance.is_installed() && is_downgrade(from, &latest) {
            log::warn!("Latest {} of {} orders before installed {}", latest, name, from);
        }
        Ok(Some(latest))
    }

    /// Stop a running instance ahead of the deploy. Returns whether it ran.
    async fn stop_for_deploy(&self, instance: &Instance) -> Result<bool> {
        let name = instance.name.as_str();
        let running = match self.supervisor.is_active(instance).await {
            Ok(running) => running,
            Err(e) => return Err(self.fail(name, "status", e).await),
        };
        if !running {
            return Ok(false);
        }
        self.emit(EventKind::InstanceStopStarted, name, payload([]))
            .await;
        if let Err(e) = self.supervisor.stop(instance).await {
            return Err(self.fail(name, "stop", e).await);
        }
        self.emit(EventKind::InstanceStopped, name, payload([])).await;
        Ok(true)
    }

    async fn backup_for_deploy(
        &self,
        instance: &Instance,
        was_running: bool,
    ) -> Result<Option<BackupInfo>> {
        match self.backup_locked(instance).await {
            Ok(backup) => Ok(backup),
            Err(e) => {
                if was_running {
                    self.restart_after_failure(instance).await;
                }
                Err(self.fail(&instance.name, "backup", e).await)
            }
        }
    }

    /// Move the staged files into the install directory.
    ///
    /// The download marker is removed before the first entry moves, so a
    /// deploy that stops partway leaves a staging directory the next update
    /// downloads again instead of reusing.
    async fn deploy(
        &self,
        instance: &Instance,
        version: &str,
        backup: Option<&BackupInfo>,
    ) -> Result<()> {
        let name = instance.name.as_str();
        self.emit(
            EventKind::InstanceDeployStarted,
            name,
            payload([("version", version)]),
        )
        .await;

        let staging = instance.staging_dir(version);
        if let Err(e) = move_staged(&staging, &instance.install_dir()) {
            log::error!(
                "Deploy of {} {} failed; backup {} kept for manual recovery",
                name,
                version,
                backup.map_or("(none)", |b| b.id.as_str())
            );
            return Err(self.fail(name, "deploy", e).await);
        }
        if let Err(e) = fs::remove_dir_all(&staging) {
            log::warn!("Failed to remove staging {:?}: {}", staging, e);
        }

        self.emit(
            EventKind::InstanceDeployFinished,
            name,
            payload([("version", version)]),
        )
        .await;
        Ok(())
    }

    /// Start the instance again if the update stopped it.
    async fn resume(&self, instance: &Instance, was_running: bool) -> Result<()> {
        if !was_running {
            return Ok(());
        }
        match self.supervisor.start(instance).await {
            Ok(()) => {
                self.emit(EventKind::InstanceStarted, &instance.name, payload([]))
                    .await;
                Ok(())
            }
            Err(e) => {
                log::error!("{} updated but failed to start again: {}", instance.name, e);
                Err(e)
            }
        }
    }

    /// Persist the deployed version. Failure only warns: the files are already in place.
    async fn record_version(&self, instance: &Instance, from: &str, to: &str) {
        let name = instance.name.as_str();
        if let Err(e) = self.instances.set_version(instance, to) {
            log::warn!(
                "{} now runs {} but its version record may be stale: {}",
                name,
                to,
                e
            );
        }
        self.emit(
            EventKind::InstanceVersionUpdated,
            name,
            payload([("from", from), ("to", to)]),
        )
        .await;
        self.emit(
            EventKind::InstanceUpdated,
            name,
            payload([("from", from), ("to", to)]),
        )
        .await;
    }

    /// Fill `temp/<version>.staging`, reusing a completed earlier download.
    async fn download(&self, instance: &Instance, blueprint: &Blueprint, version: &str) -> Result<()> {
        let name = instance.name.as_str();
        let staging = instance.staging_dir(version);
        let marker = staging.join(DOWNLOAD_MARKER);
        if marker.is_file() {
            log::info!("Reusing staged download {:?}", staging);
            return Ok(());
        }

        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| AppError::io(format!("Failed to clear {:?}: {}", staging, e)))?;
        }
        fs::create_dir_all(&staging)
            .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", staging, e)))?;

        self.emit(
            EventKind::InstanceDownloadStarted,
            name,
            payload([("version", version)]),
        )
        .await;
        let fetched = match self.downloader.fetch(blueprint, version, &staging).await {
            Ok(()) => fs::write(&marker, version).map_err(AppError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            if let Err(rm) = fs::remove_dir_all(&staging) {
                log::warn!("Failed to remove staging {:?}: {}", staging, rm);
            }
            return Err(e);
        }
        self.emit(
            EventKind::InstanceDownloadFinished,
            name,
            payload([("version", version)]),
        )
        .await;
        Ok(())
    }

    async fn restart_after_failure(&self, instance: &Instance) {
        match self.supervisor.start(instance).await {
            Ok(()) => self.emit(EventKind::InstanceStarted, &instance.name, payload([])).await,
            Err(e) => log::error!("Failed to start {} again: {}", instance.name, e),
        }
    }

    async fn fail(&self, name: &str, step: &str, error: AppError) -> AppError {
        log::error!("Update of {} failed at {}: {}", name, step, error);
        self.emit(EventKind::InstanceUpdateFailed, name, step_failed(step, &error))
            .await;
        error
    }

    /// Tear down every provisioned resource, then delete the record.
    ///
    /// Safe to re-run after a partial failure: the record goes last, and an
    /// instance without a record reports [`UninstallOutcome::AlreadyAbsent`].
    pub async fn uninstall(&self, name: &str) -> Result<UninstallOutcome> {
        let _lock = self.lock(name)?;
        if !self.instances.exists(name) {
            log::info!("Instance {} is already absent", name);
            return Ok(UninstallOutcome::AlreadyAbsent);
        }
        let instance = self.instances.load(name)?;
        let ports = match self.blueprints.load(&instance.blueprint) {
            Ok(blueprint) => blueprint.ports.clone(),
            Err(e) => {
                log::warn!("Blueprint of {} unavailable, skipping port data: {}", name, e);
                String::new()
            }
        };

        match self.supervisor.is_active(&instance).await {
            Ok(true) => {
                self.supervisor.stop(&instance).await?;
                self.emit(EventKind::InstanceStopped, name, payload([])).await;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Cannot query {} before removal: {}", name, e),
        }

        self.emit(EventKind::InstanceUninstallStarted, name, payload([]))
            .await;
        self.provisioner.remove_shortcut(&instance).await?;
        self.provisioner
            .remove_firewall_rule(&instance, &ports)
            .await?;
        self.provisioner.remove_supervision_unit(&instance).await?;
        self.emit(EventKind::InstanceFilesRemoved, name, payload([]))
            .await;

        self.provisioner.remove_directories(&instance).await?;
        self.emit(EventKind::InstanceDirectoriesRemoved, name, payload([]))
            .await;

        self.instances.delete(name)?;
        log::info!("Removed instance {}", name);
        self.emit(EventKind::InstanceUninstalled, name, payload([]))
            .await;
        self.emit(EventKind::InstanceRemoved, name, payload([])).await;
        self.emit(EventKind::InstanceUninstallFinished, name, payload([]))
            .await;
        Ok(UninstallOutcome::Removed)
    }
}
