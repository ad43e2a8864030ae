//! Lifecycle event broadcasting.
//!
//! Every lifecycle transition is announced through [`EventBus::emit`], which
//! fans out to the enabled transports. Delivery is best-effort: a failing
//! transport is logged and never turns into an error for the operation that
//! triggered the event.

mod socket;
mod webhook;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::EventsConfig;
use crate::error::Result;
use crate::paths::Layout;

pub use socket::SocketTransport;
pub use webhook::{sign_payload, WebhookTransport, SIGNATURE_HEADER};

/// Closed vocabulary of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstanceCreated,
    InstanceRemoved,
    InstanceInstallationStarted,
    InstanceInstallationFinished,
    InstanceInstalled,
    InstanceUninstallStarted,
    InstanceUninstallFinished,
    InstanceUninstalled,
    InstanceDirectoriesCreated,
    InstanceDirectoriesRemoved,
    InstanceFilesCreated,
    InstanceFilesRemoved,
    InstanceStarted,
    InstanceStopStarted,
    InstanceStopped,
    InstanceUpdateStarted,
    InstanceUpdateFinished,
    InstanceUpdateFailed,
    InstanceUpdated,
    InstanceVersionUpdated,
    InstanceVersionCheckStarted,
    InstanceVersionCheckFinished,
    InstanceDownloadStarted,
    InstanceDownloadFinished,
    InstanceDeployStarted,
    InstanceDeployFinished,
    InstanceBackupStarted,
    InstanceBackupCreated,
    InstanceBackupRestored,
    /// Synthetic event posted by transport reachability tests.
    Test,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstanceCreated => "instance_created",
            Self::InstanceRemoved => "instance_removed",
            Self::InstanceInstallationStarted => "instance_installation_started",
            Self::InstanceInstallationFinished => "instance_installation_finished",
            Self::InstanceInstalled => "instance_installed",
            Self::InstanceUninstallStarted => "instance_uninstall_started",
            Self::InstanceUninstallFinished => "instance_uninstall_finished",
            Self::InstanceUninstalled => "instance_uninstalled",
            Self::InstanceDirectoriesCreated => "instance_directories_created",
            Self::InstanceDirectoriesRemoved => "instance_directories_removed",
            Self::InstanceFilesCreated => "instance_files_created",
            Self::InstanceFilesRemoved => "instance_files_removed",
            Self::InstanceStarted => "instance_started",
            Self::InstanceStopStarted => "instance_stop_started",
            Self::InstanceStopped => "instance_stopped",
            Self::InstanceUpdateStarted => "instance_update_started",
            Self::InstanceUpdateFinished => "instance_update_finished",
            Self::InstanceUpdateFailed => "instance_update_failed",
            Self::InstanceUpdated => "instance_updated",
            Self::InstanceVersionUpdated => "instance_version_updated",
            Self::InstanceVersionCheckStarted => "instance_version_check_started",
            Self::InstanceVersionCheckFinished => "instance_version_check_finished",
            Self::InstanceDownloadStarted => "instance_download_started",
            Self::InstanceDownloadFinished => "instance_download_finished",
            Self::InstanceDeployStarted => "instance_deploy_started",
            Self::InstanceDeployFinished => "instance_deploy_finished",
            Self::InstanceBackupStarted => "instance_backup_started",
            Self::InstanceBackupCreated => "instance_backup_created",
            Self::InstanceBackupRestored => "instance_backup_restored",
            Self::Test => "test",
        }
    }
}

/// An immutable lifecycle fact.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub event: EventKind,
    pub instance: String,
    pub timestamp: String,
    pub data: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, instance: &str, data: BTreeMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event: kind,
            instance: instance.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Synthetic payload used by reachability tests.
    pub fn test() -> Self {
        Self::new(
            EventKind::Test,
            "",
            BTreeMap::from([("message".to_string(), "transport test".to_string())]),
        )
    }

    /// Single-line JSON encoding shared by all transports.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build an event payload from string pairs.
pub fn payload<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one event.
    async fn send(&self, event: &Event) -> Result<()>;

    /// Check reachability by delivering a synthetic test event.
    async fn test(&self) -> Result<()> {
        self.send(&Event::test()).await
    }
}

/// Outcome of one transport for one event.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub transport: &'static str,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fan-out of events to the enabled transports.
#[derive(Clone, Default)]
pub struct EventBus {
    transports: Vec<Arc<dyn Transport>>,
}

impl EventBus {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// A bus with no transports; emitting is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build a bus from the persisted enable flags.
    ///
    /// A transport whose settings are unusable is skipped with a warning, so a
    /// broken transport never blocks lifecycle operations.
    pub fn from_config(config: &EventsConfig, layout: &Layout) -> Self {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if config.socket.enabled {
            let path = config
                .socket
                .path
                .clone()
                .unwrap_or_else(|| layout.events_socket());
            transports.push(Arc::new(SocketTransport::new(path)));
        }
        if config.webhook.enabled {
            match WebhookTransport::from_config(&config.webhook) {
                Ok(webhook) => transports.push(Arc::new(webhook)),
                Err(e) => log::warn!("Webhook transport enabled but unusable, skipping: {}", e),
            }
        }
        Self::new(transports)
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Emit an event to every transport. Never fails.
    pub async fn emit(
        &self,
        kind: EventKind,
        instance: &str,
        data: BTreeMap<String, String>,
    ) -> Vec<Delivery> {
        if self.transports.is_empty() {
            return Vec::new();
        }
        let event = Event::new(kind, instance, data);
        let mut deliveries = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let delivery = match transport.send(&event).await {
                Ok(()) => Delivery {
                    transport: transport.name(),
                    delivered: true,
                    error: None,
                },
                Err(e) => {
                    log::warn!(
                        "Event {} for {} not delivered via {}: {}",
                        kind.as_str(),
                        instance,
                        transport.name(),
                        e
                    );
                    Delivery {
                        transport: transport.name(),
                        delivered: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            deliveries.push(delivery);
        }
        deliveries
    }

    /// Run the reachability test of every transport.
    pub async fn test_all(&self) -> Vec<Delivery> {
        let mut results = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let result = transport.test().await;
            results.push(Delivery {
                transport: transport.name(),
                delivered: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        results
    }
}
