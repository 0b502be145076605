// src/orchestrator/executor.rs

//! Task execution against depot servers
//!
//! Uploads are HTTP PUTs into the depot's package repository, made while
//! holding a transfer slot. Installs and removals go through the depot's
//! configuration service; installs reference the uploaded file by its path
//! on the depot.

use super::{Task, TaskExecutor, TaskKind, TransferSlotGuard};
use crate::backend::{Backend, PropertyDefaults};
use crate::error::{Error, Result};
use crate::hash::{md5_sidecar_path, read_md5_sidecar};
use crate::repository::{parse_package_filename, HttpSession};
use reqwest::blocking::Body;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How to reach one depot
pub struct DepotConnection {
    pub backend: Arc<dyn Backend>,
    /// Base URL of the depot's package repository (WebDAV)
    pub repository_url: Option<String>,
    /// The same repository as seen by the depot (`file://` URL); `None`
    /// when the package path is valid on the depot as is
    pub repository_local_url: Option<String>,
    pub session: HttpSession,
}

pub struct DepotTaskExecutor {
    host_id: String,
    temp_dir: Option<PathBuf>,
    depots: HashMap<String, DepotConnection>,
}

impl DepotTaskExecutor {
    /// `host_id` identifies this host when acquiring transfer slots
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            temp_dir: None,
            depots: HashMap::new(),
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: Option<PathBuf>) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    pub fn add_depot(&mut self, depot_id: impl Into<String>, connection: DepotConnection) {
        self.depots.insert(depot_id.into(), connection);
    }

    fn depot(&self, depot_id: &str) -> Result<&DepotConnection> {
        self.depots
            .get(depot_id)
            .ok_or_else(|| Error::NotFoundError(format!("No connection to depot '{depot_id}'")))
    }

    fn upload(&self, task: &Task) -> Result<()> {
        let depot = self.depot(&task.depot_id)?;
        let base_url = depot.repository_url.as_deref().ok_or_else(|| {
            Error::ConfigError(format!("Depot '{}' has no repository url", task.depot_id))
        })?;
        let package = task.package_path();
        let destination = upload_name(&package)?;

        let _slot = TransferSlotGuard::acquire(Arc::clone(&depot.backend), &task.depot_id, &self.host_id)?;
        info!("Processing upload of '{}' to depot '{}'", destination, task.depot_id);

        let url = format!("{}/{}", base_url.trim_end_matches('/'), destination);
        put_file(&depot.session, &url, &package)?;

        if read_md5_sidecar(&package).is_some() {
            put_file(&depot.session, &format!("{url}.md5"), &md5_sidecar_path(&package))?;
        }
        info!("Upload of '{}' to depot '{}' done", destination, task.depot_id);
        Ok(())
    }

    fn install(&self, task: &Task) -> Result<()> {
        let depot = self.depot(&task.depot_id)?;
        let package = task.package_path();
        let depot_package = depot_package_path(depot.repository_local_url.as_deref(), &package)?;
        info!("Path to package file on depot '{}' is '{}'", task.depot_id, depot_package.display());

        // Keep the property values currently set on the depot
        let defaults = match parse_package_filename(&upload_name(&package)?) {
            Ok((product_id, _)) => depot
                .backend
                .product_property_defaults(&product_id, &task.depot_id)
                .unwrap_or_else(|e| {
                    warn!("Failed to get product property defaults of '{}': {}", product_id, e);
                    PropertyDefaults::default()
                }),
            Err(e) => {
                warn!("{}", e);
                PropertyDefaults::default()
            }
        };

        info!("Installing '{}' on depot '{}'", depot_package.display(), task.depot_id);
        depot
            .backend
            .install_package(&depot_package, &defaults, self.temp_dir.as_deref())
    }
}

/// Location of an uploaded package in the depot's local repository
fn depot_package_path(repository_local_url: Option<&str>, package: &Path) -> Result<PathBuf> {
    let Some(url) = repository_local_url else {
        return Ok(package.to_path_buf());
    };
    let dir = url
        .strip_prefix("file://")
        .ok_or_else(|| Error::ConfigError(format!("Repository local url '{url}' not supported")))?;
    Ok(Path::new(dir.trim_end_matches('/')).join(upload_name(package)?))
}

/// Remote file name of a package; custom packages (`name~custom.opsi`)
/// are stored under their base name
fn upload_name(package: &Path) -> Result<String> {
    let name = package
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::ParseError(format!("Invalid package path {}", package.display())))?;
    match name.split_once('~') {
        Some((base, _)) => {
            debug!("Custom package detected, uploading '{}' as '{}.opsi'", name, base);
            Ok(format!("{base}.opsi"))
        }
        None => Ok(name),
    }
}

fn put_file(session: &HttpSession, url: &str, path: &Path) -> Result<()> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", path.display())))?;
    let response = session
        .put(url)
        .body(Body::from(file))
        .send()
        .map_err(|e| Error::DownloadError(format!("Upload to {url} failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::DownloadError(format!("HTTP {status} for upload to {url}")));
    }
    Ok(())
}

impl TaskExecutor for DepotTaskExecutor {
    fn execute(&self, task: &Task) -> Result<()> {
        match task.kind {
            TaskKind::Upload => self.upload(task),
            TaskKind::Install => self.install(task),
            TaskKind::Uninstall => {
                let depot = self.depot(&task.depot_id)?;
                info!("Removing product '{}' from depot '{}'", task.payload, task.depot_id);
                depot.backend.uninstall_package(&task.depot_id, &task.payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_name() {
        assert_eq!(
            upload_name(Path::new("/tmp/hwaudit_4.2.0.0-1.opsi")).unwrap(),
            "hwaudit_4.2.0.0-1.opsi"
        );
        assert_eq!(
            upload_name(Path::new("/tmp/hwaudit_4.2.0.0-1~custom1.opsi")).unwrap(),
            "hwaudit_4.2.0.0-1.opsi"
        );
    }

    #[test]
    fn test_depot_package_path() {
        let package = Path::new("/var/lib/opsi/packages/hwaudit_4.2.0.0-1~custom1.opsi");
        assert_eq!(
            depot_package_path(Some("file:///var/lib/opsi/repository/"), package).unwrap(),
            PathBuf::from("/var/lib/opsi/repository/hwaudit_4.2.0.0-1.opsi")
        );
        assert_eq!(depot_package_path(None, package).unwrap(), package);
        assert!(matches!(
            depot_package_path(Some("webdavs://depot1:4447/repository"), package),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_unknown_depot() {
        let executor = DepotTaskExecutor::new("host1");
        let task = Task::uninstall("depot9", "hwaudit");
        assert!(matches!(executor.execute(&task), Err(Error::NotFoundError(_))));
    }
}
