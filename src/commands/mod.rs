// src/commands/mod.rs
//! Command handlers for the opsi-package-updater CLI

mod list;
mod update;

pub use list::cmd_list;
pub use update::{cmd_download, cmd_update};

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use opsi_package_updater::{JsonRpcBackend, PackageUpdater, ProgressMode, TransferEngine, UpdaterConfig};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};

/// Exit code when the run finished but recorded errors
const EXIT_ERRORS_RECORDED: u8 = 2;

/// Load configuration, build the updater and run the selected mode
pub fn run(cli: &Cli) -> Result<ExitCode> {
    let mut config = UpdaterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.apply_options(cli.run_options());
    if !config.use_zsync {
        info!("Not using zsync, instead using full downloads");
    }

    let backend = JsonRpcBackend::new(&config.backend).context("Failed to set up the opsi service client")?;
    let progress = if std::io::stderr().is_terminal() {
        ProgressMode::Bar
    } else {
        ProgressMode::Log
    };
    let transfer = TransferEngine::new(&config.package_dir, config.use_zsync).with_progress(progress);
    let mut updater = PackageUpdater::new(config, Arc::new(backend))?.with_transfer(transfer);

    match &cli.command {
        Commands::Install { .. } | Commands::Update { .. } => cmd_update(&mut updater)?,
        Commands::Download { .. } => cmd_download(&mut updater)?,
        Commands::List(args) => cmd_list(&mut updater, args)?,
    }

    if updater.errors().is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for e in updater.errors() {
        debug!("Recorded error: {}", e);
    }
    Ok(ExitCode::from(EXIT_ERRORS_RECORDED))
}
