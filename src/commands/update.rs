// src/commands/update.rs
//! Install, update and download modes

use anyhow::Result;
use opsi_package_updater::PackageUpdater;
use tracing::info;

/// Download new packages and install them on the depot
pub fn cmd_update(updater: &mut PackageUpdater) -> Result<()> {
    info!("Processing updates for depot '{}'", updater.depot_id());
    updater.process_updates()?;
    Ok(())
}

/// Download new packages into the package directory
pub fn cmd_download(updater: &mut PackageUpdater) -> Result<()> {
    info!(
        "Downloading packages to {}",
        updater.config().package_dir.display()
    );
    updater.download_packages()?;
    Ok(())
}
