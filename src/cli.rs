//! Command-line surface of the `gsm` binary.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::instance::LifecycleManager;
use crate::paths::ROOT_ENV;

#[derive(Debug, Parser)]
#[command(
    name = "gsm",
    version,
    about = "Lifecycle manager for game-server instances",
    long_about = None
)]
pub struct Cli {
    /// Data root holding config, blueprints, instance records and locks.
    #[arg(long, global = true, env = ROOT_ENV)]
    pub root: Option<PathBuf>,

    /// More log output (repeat for trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(subcommand, about = "Create, deploy and control instances")]
    Instance(InstanceCommand),
    #[command(subcommand, about = "Event transports")]
    Events(EventsCommand),
    #[command(subcommand, about = "Available blueprints")]
    Blueprints(BlueprintsCommand),
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    /// Create an instance record from a blueprint.
    Create {
        blueprint: String,
        #[arg(long)]
        name: Option<String>,
        /// Working directory; defaults to `<servers_dir>/<name>`.
        #[arg(long)]
        working_dir: Option<PathBuf>,
        /// systemd, standalone or container.
        #[arg(long)]
        lifecycle_manager: Option<LifecycleManager>,
        /// Provision and deploy right away.
        #[arg(long)]
        install: bool,
    },
    /// Provision OS resources and deploy the latest version.
    Install {
        name: String,
        /// Replace an existing supervision unit.
        #[arg(long)]
        overwrite_unit: bool,
    },
    /// Tear down an instance and delete its record.
    #[command(visible_alias = "uninstall")]
    Remove { name: String },
    /// Update to the latest version of the blueprint.
    Update {
        name: String,
        /// Redeploy even when already up to date.
        #[arg(long)]
        force: bool,
    },
    /// Move the install directory into a new backup.
    Backup { name: String },
    /// List backups, newest first.
    Backups { name: String },
    /// Restore a backup into the install directory.
    Restore {
        name: String,
        /// Backup directory name; the newest backup when omitted.
        backup_id: Option<String>,
        /// Discard a non-empty install directory without asking.
        #[arg(long)]
        overwrite: bool,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Status { name: String },
    List,
    /// Firewall port string, or one `<port> <protocol>` line per port.
    Ports {
        name: String,
        #[arg(long)]
        router: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    /// Show which transports are enabled.
    Status,
    /// Send a test event through every enabled transport.
    TestAll,
    #[command(subcommand)]
    Socket(SocketCommand),
    #[command(subcommand)]
    Webhook(WebhookCommand),
}

#[derive(Debug, Subcommand)]
pub enum SocketCommand {
    Enable {
        /// Socket path; defaults to `<root>/events.sock`.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Disable,
    Test,
}

#[derive(Debug, Subcommand)]
pub enum WebhookCommand {
    Enable,
    Disable,
    Test,
    /// Change webhook settings. Omitted options keep their value.
    Set(WebhookSettings),
}

#[derive(Debug, Args)]
pub struct WebhookSettings {
    #[arg(long)]
    pub url: Option<String>,
    /// Fallback destination; pass an empty string to clear.
    #[arg(long)]
    pub secondary_url: Option<String>,
    #[arg(long)]
    pub secret: Option<String>,
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    #[arg(long)]
    pub retries: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum BlueprintsCommand {
    List,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`.
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Warn;
        }
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_with_force() {
        let cli = Cli::try_parse_from(["gsm", "instance", "update", "mc-0001", "--force"]).unwrap();
        let Command::Instance(InstanceCommand::Update { ref name, force }) = cli.command else {
            unreachable!("parsed into another command");
        };
        assert_eq!(name, "mc-0001");
        assert!(force);
        assert_eq!(cli.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn parses_lifecycle_manager_and_globals() {
        let cli = Cli::try_parse_from([
            "gsm",
            "--json",
            "-vv",
            "instance",
            "create",
            "valheim",
            "--lifecycle-manager",
            "container",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.log_level(), log::LevelFilter::Trace);
        let Command::Instance(InstanceCommand::Create {
            lifecycle_manager, ..
        }) = cli.command
        else {
            unreachable!("parsed into another command");
        };
        assert_eq!(lifecycle_manager, Some(LifecycleManager::Container));
    }

    #[test]
    fn rejects_unknown_lifecycle_manager() {
        assert!(Cli::try_parse_from([
            "gsm",
            "instance",
            "create",
            "valheim",
            "--lifecycle-manager",
            "launchd",
        ])
        .is_err());
    }

    #[test]
    fn uninstall_is_an_alias_of_remove() {
        let cli = Cli::try_parse_from(["gsm", "instance", "uninstall", "x"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Instance(InstanceCommand::Remove { .. })
        ));
    }
}
