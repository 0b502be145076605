// src/transfer/mod.rs

//! Package transfer into the local package directory
//!
//! A package is fetched with zsync when an older local version of the
//! product exists and the server accepts range requests, otherwise with a
//! full download. The result is checked against the advertised MD5; a
//! failed zsync or a failed verification is retried once as a full
//! download before the package is given up.

mod cache;
mod download;

pub use cache::{cleanup, find_local_package, scan_local_packages, KeepRights, LocalPackage, RightsSetter};
pub use download::download_package;

use crate::error::{Error, Result};
use crate::hash::{verify_file, HashAlgorithm};
use crate::progress::{ProgressFactory, ProgressMode};
use crate::repository::{HttpSession, PackageRecord};
use crate::zsync::{self, CircuitBreaker, ZsyncStats};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How a package ended up in the package directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Zsync(ZsyncStats),
    Full { bytes: u64 },
}

/// Result of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub method: TransferMethod,
    /// Summary lines for the run report
    pub notes: Vec<String>,
}

/// Fetches packages into one package directory
pub struct TransferEngine {
    package_dir: PathBuf,
    use_zsync: bool,
    progress: Box<dyn ProgressFactory>,
    rights: Arc<dyn RightsSetter>,
}

impl TransferEngine {
    pub fn new(package_dir: impl Into<PathBuf>, use_zsync: bool) -> Self {
        Self {
            package_dir: package_dir.into(),
            use_zsync,
            progress: Box::new(ProgressMode::default()),
            rights: Arc::new(KeepRights),
        }
    }

    pub fn with_progress(mut self, progress: impl ProgressFactory + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn with_rights(mut self, rights: Arc<dyn RightsSetter>) -> Self {
        self.rights = rights;
        self
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    /// Tidy the package directory around an already present package
    pub fn cleanup(&self, available: &PackageRecord) -> Result<()> {
        cleanup(&self.package_dir, available, self.rights.as_ref())
    }

    /// Whether `available` can be fetched as a delta against `local`
    pub fn should_use_zsync(
        &self,
        session: &HttpSession,
        available: &PackageRecord,
        local: Option<&LocalPackage>,
    ) -> bool {
        if !self.use_zsync || local.is_none() {
            return false;
        }
        if available.zsync_url.is_none() {
            info!("{} - no zsync file available, using full download", available.product_id);
            return false;
        }
        match session.accepts_ranges(&available.package_url) {
            Ok(true) => true,
            Ok(false) => {
                warn!("Cannot use zsync, server or proxy does not accept ranges");
                false
            }
            Err(e) => {
                warn!("Cannot use zsync, range support check failed: {}", e);
                false
            }
        }
    }

    /// Fetch `available`, verify it and clean up the package directory
    pub fn fetch(
        &self,
        session: &HttpSession,
        available: &PackageRecord,
        local: Option<&LocalPackage>,
    ) -> Result<TransferOutcome> {
        let target = self.package_dir.join(&available.filename);
        let mut notes = Vec::new();

        let first = if self.should_use_zsync(session, available, local) {
            self.zsync_transfer(session, available, local, &target, &mut notes)
        } else {
            self.full_transfer(session, available, &target, &mut notes)
        };

        let method = match first.and_then(|method| verify_download(available, &target).map(|()| method)) {
            Ok(method) => method,
            Err(e) if e.allows_full_download_retry() => {
                warn!("{}, trying full download", e);
                self.full_transfer(session, available, &target, &mut notes)
                    .and_then(|method| verify_download(available, &target).map(|()| method))
                    .map_err(mark_retried)?
            }
            Err(e) => return Err(e),
        };

        cleanup(&self.package_dir, available, self.rights.as_ref())?;

        Ok(TransferOutcome {
            path: target,
            method,
            notes,
        })
    }

    fn zsync_transfer(
        &self,
        session: &HttpSession,
        available: &PackageRecord,
        local: Option<&LocalPackage>,
        target: &Path,
        notes: &mut Vec<String>,
    ) -> Result<TransferMethod> {
        let control_url = available.zsync_url.as_deref().ok_or_else(|| Error::ZsyncFailed {
            url: available.package_url.clone(),
            message: "no zsync file advertised".to_string(),
            retried: false,
        })?;

        if let Some(local) = local {
            if local.path != target {
                info!("Renaming {} to {}", local.path.display(), target.display());
                fs::rename(&local.path, target)?;
            }
        }

        info!("Zsyncing {} to {}", available.package_url, target.display());
        let progress = self.progress.start(&available.filename, 0);
        let mut breaker = CircuitBreaker::default();
        match zsync::sync_file(
            session,
            control_url,
            &available.package_url,
            target,
            &mut breaker,
            progress.as_ref(),
        ) {
            Ok(stats) => {
                notes.push(format!(
                    "Zsync of '{}' completed ({:.0}% reused)",
                    available.package_url,
                    stats.local_percent()
                ));
                Ok(TransferMethod::Zsync(stats))
            }
            Err(e) => {
                error!("{}", e);
                progress.finish_with_error(&e.to_string());
                notes.push(e.to_string());
                Err(e)
            }
        }
    }

    fn full_transfer(
        &self,
        session: &HttpSession,
        available: &PackageRecord,
        target: &Path,
        notes: &mut Vec<String>,
    ) -> Result<TransferMethod> {
        let progress = self.progress.start(&available.filename, 0);
        let bytes = download_package(session, &available.package_url, target, progress.as_ref())?;
        notes.push(format!(
            "Download of '{}' completed (~{})",
            available.package_url,
            format_size(bytes)
        ));
        Ok(TransferMethod::Full { bytes })
    }
}

/// Compare the file against the advertised MD5
///
/// Packages without an advertised checksum pass with a warning.
pub fn verify_download(available: &PackageRecord, path: &Path) -> Result<()> {
    let Some(expected) = available.md5sum.as_deref() else {
        warn!(
            "{}: cannot verify download, no md5sum advertised by repository '{}'",
            available.filename, available.repository.name
        );
        return Ok(());
    };

    let verified = verify_file(path, expected, HashAlgorithm::Md5)
        .map_err(|e| Error::IoError(format!("Failed to hash {}: {e}", path.display())))?;
    match verified {
        Ok(()) => {
            info!("{}: md5sum verified", available.filename);
            Ok(())
        }
        Err(mismatch) => Err(Error::ChecksumMismatch {
            name: available.filename.clone(),
            expected: mismatch.expected,
            actual: mismatch.actual,
            retried: false,
        }),
    }
}

fn mark_retried(err: Error) -> Error {
    match err {
        Error::ChecksumMismatch {
            name,
            expected,
            actual,
            ..
        } => Error::ChecksumMismatch {
            name,
            expected,
            actual,
            retried: true,
        },
        Error::ZsyncFailed { url, message, .. } => Error::ZsyncFailed {
            url,
            message,
            retried: true,
        },
        other => other,
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
