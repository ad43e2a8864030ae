//! Handlers behind each CLI subcommand.

use std::io::{BufRead as _, IsTerminal as _, Write as _};

use serde::Serialize;

use crate::cli::{
    BlueprintsCommand, Command, EventsCommand, InstanceCommand, SocketCommand, WebhookCommand,
    WebhookSettings,
};
use crate::config::{AppConfig, ConfigStore};
use crate::error::{AppError, Result};
use crate::events::{Delivery, EventBus, SocketTransport, Transport, WebhookTransport};
use crate::instance::{CreateOptions, InstanceStatus};
use crate::lifecycle::{BackupInfo, Orchestrator, UninstallOutcome, UpdateOutcome};
use crate::paths::{is_dir_empty, Layout};

/// Shared state of one CLI invocation.
pub struct Context {
    layout: Layout,
    config: ConfigStore,
    json: bool,
}

impl Context {
    pub fn new(layout: Layout, json: bool) -> Self {
        let config = ConfigStore::new(layout.config_path());
        Self {
            layout,
            config,
            json,
        }
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        self.layout.ensure_dirs()?;
        let config = self.config.load()?;
        Orchestrator::from_config(self.layout.clone(), &config)
    }

    /// Print `value` as JSON, or the human-readable `text`.
    fn output<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

pub async fn execute(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Instance(cmd) => instance(ctx, cmd).await,
        Command::Events(cmd) => events(ctx, cmd).await,
        Command::Blueprints(BlueprintsCommand::List) => {
            let orchestrator = ctx.orchestrator()?;
            let names = orchestrator.blueprints().list()?;
            ctx.output(&names, || names.join("\n"))
        }
    }
}

async fn instance(ctx: &Context, cmd: InstanceCommand) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    match cmd {
        InstanceCommand::Create {
            blueprint,
            name,
            working_dir,
            lifecycle_manager,
            install,
        } => {
            let created = orchestrator
                .create(
                    &blueprint,
                    CreateOptions {
                        name,
                        working_dir,
                        lifecycle_manager,
                    },
                )
                .await?;
            if !ctx.json {
                println!(
                    "Created {} ({}, {}) in {}",
                    created.name,
                    created.blueprint,
                    created.lifecycle_manager,
                    created.working_dir.display()
                );
            }
            if install {
                let outcome = orchestrator.install(&created.name, false).await?;
                return print_update(ctx, &created.name, &outcome);
            }
            if ctx.json {
                print_status(ctx, &orchestrator.status(&created.name).await?)?;
            }
            Ok(())
        }
        InstanceCommand::Install {
            name,
            overwrite_unit,
        } => {
            let outcome = orchestrator.install(&name, overwrite_unit).await?;
            print_update(ctx, &name, &outcome)
        }
        InstanceCommand::Remove { name } => {
            let outcome = orchestrator.uninstall(&name).await?;
            ctx.output(&outcome, || match outcome {
                UninstallOutcome::Removed => format!("Removed {}", name),
                UninstallOutcome::AlreadyAbsent => format!("{} does not exist, nothing to remove", name),
            })
        }
        InstanceCommand::Update { name, force } => {
            let outcome = orchestrator.update(&name, force).await?;
            print_update(ctx, &name, &outcome)
        }
        InstanceCommand::Backup { name } => {
            let backup = orchestrator.backup(&name).await?;
            ctx.output(&backup, || match &backup {
                Some(info) => format!("Created backup {}", info.id),
                None => format!("Install directory of {} is empty, nothing to back up", name),
            })
        }
        InstanceCommand::Backups { name } => {
            let backups = orchestrator.list_backups(&name)?;
            ctx.output(&backups, || format_backups(&backups))
        }
        InstanceCommand::Restore {
            name,
            backup_id,
            overwrite,
        } => {
            let overwrite = overwrite || confirm_overwrite(&orchestrator, &name)?;
            let outcome = orchestrator
                .restore(&name, backup_id.as_deref(), overwrite)
                .await?;
            ctx.output(&outcome, || {
                format!("Restored {} from {} (version {})", name, outcome.backup, outcome.version)
            })
        }
        InstanceCommand::Start { name } => {
            orchestrator.start(&name).await?;
            print_status(ctx, &orchestrator.status(&name).await?)
        }
        InstanceCommand::Stop { name } => {
            orchestrator.stop(&name).await?;
            print_status(ctx, &orchestrator.status(&name).await?)
        }
        InstanceCommand::Restart { name } => {
            orchestrator.restart(&name).await?;
            print_status(ctx, &orchestrator.status(&name).await?)
        }
        InstanceCommand::Status { name } => print_status(ctx, &orchestrator.status(&name).await?),
        InstanceCommand::List => {
            let statuses = orchestrator.list().await?;
            ctx.output(&statuses, || {
                statuses
                    .iter()
                    .map(format_status)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        InstanceCommand::Ports { name, router } => {
            if router {
                let lines = orchestrator.router_ports(&name)?;
                ctx.output(&lines, || lines.join("\n"))
            } else {
                let ports = orchestrator.firewall_ports(&name)?;
                ctx.output(&ports, || ports.clone())
            }
        }
    }
}

fn print_update(ctx: &Context, name: &str, outcome: &UpdateOutcome) -> Result<()> {
    ctx.output(outcome, || match outcome {
        UpdateOutcome::UpToDate { version } => {
            format!("{} is already up to date ({})", name, version)
        }
        UpdateOutcome::Updated { from, to, backup } => {
            let mut line = if from.is_empty() || from == "0" {
                format!("Installed {} {}", name, to)
            } else {
                format!("Updated {} from {} to {}", name, from, to)
            };
            if let Some(backup) = backup {
                line.push_str(&format!(", previous files in backup {}", backup));
            }
            line
        }
    })
}

fn print_status(ctx: &Context, status: &InstanceStatus) -> Result<()> {
    ctx.output(status, || format_status(status))
}

fn format_status(status: &InstanceStatus) -> String {
    let version = if status.installed {
        status.installed_version.as_str()
    } else {
        "not installed"
    };
    format!(
        "{}\t{}\t{}\t{}\t{}",
        status.name,
        status.blueprint,
        version,
        status.lifecycle_manager,
        if status.running { "running" } else { "stopped" }
    )
}

fn format_backups(backups: &[BackupInfo]) -> String {
    if backups.is_empty() {
        return "No backups".to_string();
    }
    backups
        .iter()
        .map(|b| {
            format!(
                "{}\t{}\t{}",
                b.id,
                b.version,
                b.created_at.as_deref().unwrap_or(&b.timestamp)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ask before a restore discards a non-empty install directory.
///
/// Without a terminal the answer is "no" and the restore reports `NotEmpty`.
fn confirm_overwrite(orchestrator: &Orchestrator, name: &str) -> Result<bool> {
    let instance = orchestrator.instances().load(name)?;
    let install_dir = instance.install_dir();
    if is_dir_empty(&install_dir)? || !std::io::stdin().is_terminal() {
        return Ok(false);
    }

    print!(
        "{} is not empty. Discard its contents and restore? [y/N] ",
        install_dir.display()
    );
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[derive(Serialize)]
struct EventsStatus {
    socket_enabled: bool,
    socket_path: String,
    webhook_enabled: bool,
    webhook_url: String,
    webhook_secondary_url: String,
    webhook_signed: bool,
    webhook_timeout_secs: u64,
    webhook_retries: u32,
}

async fn events(ctx: &Context, cmd: EventsCommand) -> Result<()> {
    match cmd {
        EventsCommand::Status => {
            let config = ctx.config.load()?;
            let status = events_status(&ctx.layout, &config);
            ctx.output(&status, || {
                format!(
                    "socket:  {} ({})\nwebhook: {} ({}{})",
                    on_off(status.socket_enabled),
                    status.socket_path,
                    on_off(status.webhook_enabled),
                    if status.webhook_url.is_empty() {
                        "no url"
                    } else {
                        status.webhook_url.as_str()
                    },
                    if status.webhook_secondary_url.is_empty() {
                        String::new()
                    } else {
                        format!(", fallback {}", status.webhook_secondary_url)
                    }
                )
            })
        }
        EventsCommand::TestAll => {
            let config = ctx.config.load()?;
            let bus = EventBus::from_config(&config.events, &ctx.layout);
            if bus.is_empty() {
                return Err(AppError::invalid_config("No event transport is enabled"));
            }
            report_deliveries(ctx, &bus.test_all().await)
        }
        EventsCommand::Socket(cmd) => socket(ctx, cmd).await,
        EventsCommand::Webhook(cmd) => webhook(ctx, cmd).await,
    }
}

fn events_status(layout: &Layout, config: &AppConfig) -> EventsStatus {
    let socket_path = config
        .events
        .socket
        .path
        .clone()
        .unwrap_or_else(|| layout.events_socket());
    let webhook = &config.events.webhook;
    EventsStatus {
        socket_enabled: config.events.socket.enabled,
        socket_path: socket_path.display().to_string(),
        webhook_enabled: webhook.enabled,
        webhook_url: webhook.url.clone(),
        webhook_secondary_url: webhook.secondary_url.clone(),
        webhook_signed: !webhook.secret.is_empty(),
        webhook_timeout_secs: webhook.timeout_secs,
        webhook_retries: webhook.retries,
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Print each delivery; fail when none got through.
fn report_deliveries(ctx: &Context, deliveries: &[Delivery]) -> Result<()> {
    ctx.output(&deliveries, || {
        deliveries
            .iter()
            .map(|d| match &d.error {
                None => format!("{}: ok", d.transport),
                Some(e) => format!("{}: failed ({})", d.transport, e),
            })
            .collect::<Vec<_>>()
            .join("\n")
    })?;
    if deliveries.iter().any(|d| d.delivered) {
        Ok(())
    } else {
        Err(AppError::transport("No transport delivered the test event"))
    }
}

async fn socket(ctx: &Context, cmd: SocketCommand) -> Result<()> {
    match cmd {
        SocketCommand::Enable { path } => {
            ctx.config.update(|config| {
                config.events.socket.enabled = true;
                if path.is_some() {
                    config.events.socket.path = path;
                }
                Ok(())
            })?;
            log::info!("Socket transport enabled");
            Ok(())
        }
        SocketCommand::Disable => {
            ctx.config.update(|config| {
                config.events.socket.enabled = false;
                Ok(())
            })?;
            log::info!("Socket transport disabled");
            Ok(())
        }
        SocketCommand::Test => {
            let config = ctx.config.load()?;
            let path = config
                .events
                .socket
                .path
                .clone()
                .unwrap_or_else(|| ctx.layout.events_socket());
            let transport = SocketTransport::new(path);
            test_one(ctx, &transport).await
        }
    }
}

async fn webhook(ctx: &Context, cmd: WebhookCommand) -> Result<()> {
    match cmd {
        WebhookCommand::Enable => {
            ctx.config.update(|config| {
                if config.events.webhook.url.trim().is_empty() {
                    return Err(AppError::invalid_argument(
                        "Set a webhook URL first (events webhook set --url ...)",
                    ));
                }
                config.events.webhook.enabled = true;
                Ok(())
            })?;
            log::info!("Webhook transport enabled");
            Ok(())
        }
        WebhookCommand::Disable => {
            ctx.config.update(|config| {
                config.events.webhook.enabled = false;
                Ok(())
            })?;
            log::info!("Webhook transport disabled");
            Ok(())
        }
        WebhookCommand::Test => {
            let config = ctx.config.load()?;
            let transport = WebhookTransport::from_config(&config.events.webhook)?;
            test_one(ctx, &transport).await
        }
        WebhookCommand::Set(settings) => {
            ctx.config.update(|config| apply_webhook_settings(config, settings))?;
            log::info!("Webhook settings saved");
            Ok(())
        }
    }
}

fn apply_webhook_settings(config: &mut AppConfig, settings: WebhookSettings) -> Result<()> {
    let webhook = &mut config.events.webhook;
    if let Some(url) = settings.url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AppError::invalid_argument(format!("Not an HTTP URL: {}", url)));
        }
        webhook.url = url;
    }
    if let Some(url) = settings.secondary_url {
        webhook.secondary_url = url;
    }
    if let Some(secret) = settings.secret {
        webhook.secret = secret;
    }
    if let Some(timeout) = settings.timeout_secs {
        if timeout == 0 {
            return Err(AppError::invalid_argument("Webhook timeout must be positive"));
        }
        webhook.timeout_secs = timeout;
    }
    if let Some(retries) = settings.retries {
        webhook.retries = retries;
    }
    Ok(())
}

async fn test_one(ctx: &Context, transport: &dyn Transport) -> Result<()> {
    let result = transport.test().await;
    report_deliveries(
        ctx,
        &[Delivery {
            transport: transport.name(),
            delivered: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }],
    )
}
