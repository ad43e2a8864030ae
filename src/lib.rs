pub mod archive;
pub mod blueprint;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod github;
pub mod instance;
pub mod kv;
pub mod lifecycle;
pub mod lock;
pub mod paths;
pub mod ports;
pub mod process;
pub mod provision;
pub mod validation;
pub mod version;

use std::process::ExitCode;

use clap::Parser as _;

use cli::Cli;
use commands::Context;
pub use error::{AppError, ErrorKind, Result};
use paths::{absolute, default_root, Layout};

/// Entry point of the `gsm` binary. Maps every failure to its kind's exit code.
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .format_target(false)
        .init();

    let json = cli.json;
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                match serde_json::to_string_pretty(&e) {
                    Ok(body) => println!("{}", body),
                    Err(_) => eprintln!("{}", e),
                }
            } else {
                log::error!("{}", e);
            }
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let root = match &cli.root {
        Some(root) => absolute(root)?,
        None => default_root()?,
    };
    let ctx = Context::new(Layout::new(root), cli.json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::other(format!("Failed to start async runtime: {}", e)))?;
    runtime.block_on(commands::execute(&ctx, cli.command))
}
