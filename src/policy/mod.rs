// src/policy/mod.rs

//! Version policy
//!
//! Decides per package whether it must be installed and whether it must be
//! downloaded, reduces discovery results to the newest version per
//! product, and orders the install sequence.

mod ordering;
mod window;

pub use ordering::repair_dependency_order;
pub use window::{in_installation_window, InstallationWindow};

use crate::backend::InstalledProduct;
use crate::error::{Error, Result};
use crate::hash::md5_file;
use crate::repository::PackageRecord;
use crate::transfer::LocalPackage;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info};

/// Whether `available` should be installed on the depot
///
/// Missing products are installed when the repository has `autoInstall`,
/// newer versions when it has `autoUpdate`. Equal or older versions never
/// are.
pub fn is_install_needed(available: &PackageRecord, installed: Option<&InstalledProduct>) -> bool {
    let repo = &available.repository;
    let Some(installed) = installed else {
        if repo.auto_install {
            info!("{} - installation required: product not installed", available.product_id);
            return true;
        }
        info!(
            "{} - installation not required: product not installed but automatic install disabled",
            available.product_id
        );
        return false;
    };

    match available.version.compare(&installed.version()) {
        Ordering::Greater if repo.auto_update => {
            info!(
                "{} - installation required: version on repository {} is newer than installed {}",
                available.product_id,
                available.version,
                installed.version()
            );
            true
        }
        Ordering::Greater => {
            info!(
                "{} - installation not required: newer version {} available but automatic update disabled",
                available.product_id, available.version
            );
            false
        }
        _ => {
            info!(
                "{} - installation not required: installed version {} is up to date",
                available.product_id,
                installed.version()
            );
            false
        }
    }
}

/// Whether `available` must be (re)downloaded into the package directory
///
/// `force` always wins. Otherwise a local copy is kept only if its filename
/// equals the advertised one and its recomputed MD5 equals the advertised
/// checksum.
pub fn is_download_needed(
    local: Option<&LocalPackage>,
    available: &PackageRecord,
    force: bool,
) -> Result<bool> {
    if force {
        info!("{} - download of package forced", available.product_id);
        return Ok(true);
    }
    let Some(local) = local else {
        info!("{} - download required: no local package found", available.product_id);
        return Ok(true);
    };
    let Some(expected) = available.md5sum.as_deref() else {
        info!(
            "{} - download required: no md5sum advertised for {}",
            available.product_id, available.filename
        );
        return Ok(true);
    };

    if local.filename != available.filename {
        info!(
            "{} - download required: local file {} differs from {}",
            available.product_id, local.filename, available.filename
        );
        return Ok(true);
    }

    if let Some(known) = local.md5sum.as_deref() {
        if !known.eq_ignore_ascii_case(expected) {
            info!(
                "{} - download required: md5sum of local file {} differs from repository",
                available.product_id, local.filename
            );
            return Ok(true);
        }
    }

    let actual = md5_file(&local.path)
        .map_err(|e| Error::IoError(format!("Failed to hash {}: {e}", local.path.display())))?;
    if !actual.eq_ignore_ascii_case(expected) {
        info!(
            "{} - download required: md5sum of local file {} differs from repository",
            available.product_id, local.filename
        );
        return Ok(true);
    }

    info!(
        "{} - download not required: local file {} is up to date",
        available.product_id, local.filename
    );
    Ok(false)
}

/// Keep only the newest version of every product
///
/// Ties keep the first record seen; output preserves first-seen product
/// order.
pub fn only_newest_packages(packages: Vec<PackageRecord>) -> Vec<PackageRecord> {
    let mut newest: Vec<PackageRecord> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for package in packages {
        match positions.get(&package.product_id) {
            Some(&idx) => {
                if package.version > newest[idx].version {
                    debug!(
                        "Preferring {} from {} over {} from {}",
                        package, package.repository.name, newest[idx], newest[idx].repository.name
                    );
                    newest[idx] = package;
                }
            }
            None => {
                positions.insert(package.product_id.clone(), newest.len());
                newest.push(package);
            }
        }
    }

    newest
}

/// Restrict packages to the requested product ids
///
/// An empty request keeps everything. Every requested id must be
/// available.
pub fn filter_products(packages: Vec<PackageRecord>, product_ids: &[String]) -> Result<Vec<PackageRecord>> {
    if product_ids.is_empty() {
        return Ok(packages);
    }

    for product_id in product_ids {
        if !packages.iter().any(|p| p.product_id == *product_id) {
            let mut available: Vec<String> = packages.iter().map(|p| p.product_id.clone()).collect();
            available.sort();
            available.dedup();
            return Err(Error::ProductNotFound {
                product_id: product_id.clone(),
                available,
            });
        }
    }

    Ok(packages
        .into_iter()
        .filter(|p| product_ids.contains(&p.product_id))
        .collect())
}
