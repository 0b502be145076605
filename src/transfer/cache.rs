// src/transfer/cache.rs

//! Local package directory
//!
//! Lists the `.opsi` files in the package directory and prunes it after a
//! package has been fetched: transfer leftovers and other versions of the
//! same product are removed, then `.md5` and `.zsync` sidecars are
//! written for the new package.

use crate::error::{Error, Result};
use crate::hash::{md5_file, read_md5_sidecar, write_md5_sidecar};
use crate::repository::{parse_package_filename, PackageRecord};
use crate::version::ProductVersion;
use crate::zsync::{write_control_file, CONTROL_DOWNLOAD_SUFFIX, TMP_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Suffix of files left behind by older zsync clients
const ZS_OLD_SUFFIX: &str = ".zs-old";

/// Sidecar suffixes belonging to a package file
const SIDECAR_SUFFIXES: &[&str] = &[".md5", ".zsync"];

/// A package file in the local package directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPackage {
    pub product_id: String,
    pub version: ProductVersion,
    pub filename: String,
    pub path: PathBuf,
    /// From the `.md5` sidecar, or computed when forced or missing
    pub md5sum: Option<String>,
}

/// List the packages in `dir` (not recursive)
///
/// Unless `force_checksum` is set, checksums are taken from existing
/// `.md5` sidecars. Files with unparsable names are skipped.
pub fn scan_local_packages(dir: &Path, force_checksum: bool) -> Result<Vec<LocalPackage>> {
    info!("Getting info for local packages in '{}'", dir.display());
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "opsi"))
        .collect();
    entries.sort();

    let mut packages = Vec::new();
    for path in entries {
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        info!("Found local package '{}'", path.display());

        let (product_id, version) = match parse_package_filename(&filename) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Failed to process file '{}': {}", filename, e);
                continue;
            }
        };

        let md5sum = if force_checksum {
            None
        } else {
            read_md5_sidecar(&path)
        };
        let md5sum = match md5sum {
            Some(sum) => Some(sum),
            None => {
                debug!("Calculating checksum for {}", path.display());
                Some(md5_file(&path)?)
            }
        };

        packages.push(LocalPackage {
            product_id,
            version,
            filename,
            path,
            md5sum,
        });
    }

    Ok(packages)
}

/// First local package of the same product
pub fn find_local_package<'a>(locals: &'a [LocalPackage], product_id: &str) -> Option<&'a LocalPackage> {
    let found = locals.iter().find(|l| l.product_id == product_id);
    if let Some(local) = found {
        debug!("Found local package file '{}'", local.filename);
    }
    found
}

/// Product id and version of a package or sidecar file name
fn parse_any_filename(filename: &str) -> Option<(String, ProductVersion)> {
    let base = SIDECAR_SUFFIXES
        .iter()
        .find_map(|suffix| filename.strip_suffix(suffix))
        .unwrap_or(filename);
    if !base.ends_with(".opsi") {
        return None;
    }
    parse_package_filename(base).ok()
}

fn is_transfer_leftover(filename: &str) -> bool {
    filename.ends_with(ZS_OLD_SUFFIX)
        || filename.ends_with(CONTROL_DOWNLOAD_SUFFIX)
        || filename.contains(TMP_SUFFIX)
}

/// Applies ownership and permissions to files in the package directory
pub trait RightsSetter: Send + Sync {
    fn set_rights(&self, path: &Path) -> Result<()>;
}

/// Leaves ownership and permissions untouched
#[derive(Debug, Default)]
pub struct KeepRights;

impl RightsSetter for KeepRights {
    fn set_rights(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Prune `dir` around the freshly fetched `package`
///
/// Removal failures are logged; the checksum sidecar of the new package
/// must be written.
pub fn cleanup(dir: &Path, package: &PackageRecord, rights: &dyn RightsSetter) -> Result<()> {
    info!("Cleaning up in {}", dir.display());

    if let Err(e) = rights.set_rights(dir) {
        warn!("Failed to set rights on directory '{}': {}", dir.display(), e);
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", dir.display())))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();

        let obsolete = if is_transfer_leftover(&filename) {
            true
        } else {
            match parse_any_filename(&filename) {
                Some((product_id, version)) => {
                    product_id == package.product_id && version != package.version
                }
                None => false,
            }
        };
        if obsolete {
            info!("Deleting obsolete file '{}'", path.display());
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete '{}': {}", path.display(), e);
            }
        }
    }

    let package_file = dir.join(&package.filename);
    info!("Creating md5sum file '{}.md5'", package_file.display());
    write_md5_sidecar(&package_file).map_err(|e| {
        Error::IoError(format!("Failed to write md5sum file for {}: {e}", package_file.display()))
    })?;
    if let Err(e) = rights.set_rights(&crate::hash::md5_sidecar_path(&package_file)) {
        warn!("Failed to set rights on md5sum file: {}", e);
    }

    info!("Creating zsync file '{}.zsync'", package_file.display());
    if let Err(e) = write_control_file(&package_file) {
        error!("Failed to create zsync file for '{}': {}", package_file.display(), e);
    }

    Ok(())
}
