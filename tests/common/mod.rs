// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use httpmock::MockServer;
use opsi_package_updater::backend::{ProductInfo, PropertyDefaults, TransferSlot};
use opsi_package_updater::{Backend, InstalledProduct, RepositoryDescriptor, Result, UpdaterConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEPOT_ID: &str = "depot.example.org";

/// In-memory configuration service recording every call
#[derive(Default)]
pub struct RecordingBackend {
    pub installed: Vec<InstalledProduct>,
    /// Returned by `product_info` once the product was installed
    pub products: HashMap<String, ProductInfo>,
    pub clients: Vec<String>,
    /// Clients reported as having any queried product installed
    pub clients_with_product: Vec<String>,
    pub retention: Option<f64>,
    calls: Mutex<Vec<String>>,
    installed_files: Mutex<Vec<String>>,
    install_paths: Mutex<Vec<PathBuf>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            retention: Some(60.0),
            ..Default::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Package paths handed to `install_package`
    pub fn install_paths(&self) -> Vec<PathBuf> {
        self.install_paths.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .collect()
    }

    fn is_installed(&self, product_id: &str) -> bool {
        self.installed_files
            .lock()
            .unwrap()
            .iter()
            .any(|f| f.starts_with(&format!("{product_id}_")))
    }
}

impl Backend for RecordingBackend {
    fn installed_products(&self, depot_id: &str) -> Result<Vec<InstalledProduct>> {
        self.record(format!("installed_products {depot_id}"));
        Ok(self.installed.clone())
    }

    fn install_package(
        &self,
        package: &Path,
        _property_defaults: &PropertyDefaults,
        _temp_dir: Option<&Path>,
    ) -> Result<()> {
        let name = package.file_name().unwrap().to_string_lossy().into_owned();
        self.record(format!("install_package {name}"));
        self.installed_files.lock().unwrap().push(name);
        self.install_paths.lock().unwrap().push(package.to_path_buf());
        Ok(())
    }

    fn uninstall_package(&self, depot_id: &str, product_id: &str) -> Result<()> {
        self.record(format!("uninstall_package {depot_id} {product_id}"));
        Ok(())
    }

    fn product_property_defaults(&self, product_id: &str, object_id: &str) -> Result<PropertyDefaults> {
        self.record(format!("product_property_defaults {product_id} {object_id}"));
        Ok(PropertyDefaults::default())
    }

    fn product_info(&self, depot_id: &str, product_id: &str) -> Result<Option<ProductInfo>> {
        self.record(format!("product_info {depot_id} {product_id}"));
        if !self.is_installed(product_id) {
            return Ok(None);
        }
        Ok(self.products.get(product_id).cloned())
    }

    fn clients_for_depot(&self, depot_id: &str) -> Result<Vec<String>> {
        self.record(format!("clients_for_depot {depot_id}"));
        Ok(self.clients.clone())
    }

    fn clients_with_product_installed(&self, product_id: &str, client_ids: &[String]) -> Result<Vec<String>> {
        self.record(format!("clients_with_product_installed {product_id}"));
        Ok(self
            .clients_with_product
            .iter()
            .filter(|c| client_ids.contains(c))
            .cloned()
            .collect())
    }

    fn set_product_action_request(&self, product_id: &str, client_id: &str, action: &str) -> Result<()> {
        self.record(format!("set_product_action_request {product_id} {client_id} {action}"));
        Ok(())
    }

    fn mark_product_cache_outdated(&self, depot_id: &str) -> Result<()> {
        self.record(format!("mark_product_cache_outdated {depot_id}"));
        Ok(())
    }

    fn power_on_hosts(&self, host_ids: &[String]) -> Result<()> {
        self.record(format!("power_on_hosts {}", host_ids.join(",")));
        Ok(())
    }

    fn acquire_transfer_slot(&self, depot_id: &str, host_id: &str, slot_id: Option<&str>) -> Result<TransferSlot> {
        self.record(format!(
            "acquire_transfer_slot {depot_id} {host_id} {}",
            slot_id.unwrap_or("-")
        ));
        Ok(TransferSlot {
            slot_id: slot_id.unwrap_or("slot-1").to_string(),
            retention: self.retention,
        })
    }

    fn release_transfer_slot(&self, depot_id: &str, host_id: &str, slot_id: &str) -> Result<()> {
        self.record(format!("release_transfer_slot {depot_id} {host_id} {slot_id}"));
        Ok(())
    }
}

pub fn installed(product_id: &str, product_version: &str, package_version: &str) -> InstalledProduct {
    InstalledProduct {
        product_id: product_id.to_string(),
        product_version: product_version.to_string(),
        package_version: package_version.to_string(),
        depot_id: DEPOT_ID.to_string(),
    }
}

pub fn localboot_with_setup() -> ProductInfo {
    ProductInfo {
        product_type: "LocalbootProduct".to_string(),
        has_setup_script: true,
    }
}

/// An active repository served by `server`
pub fn repository(server: &MockServer, name: &str) -> RepositoryDescriptor {
    let mut repo = RepositoryDescriptor::new(name, server.base_url());
    repo.active = true;
    repo
}

/// Configuration for `depot.example.org` with packages below `dir`
pub fn config(dir: &Path, repositories: Vec<RepositoryDescriptor>) -> UpdaterConfig {
    let mut config = UpdaterConfig::default();
    config.package_dir = dir.join("packages");
    config.repository_config_dir = dir.join("repos.d");
    config.backend.depot_id = Some(DEPOT_ID.to_string());
    config.repositories = repositories;
    config
}

/// Apache style directory listing linking `names`
pub fn directory_listing(names: &[&str]) -> String {
    let mut html = String::from("<html><head><title>Index of /</title></head><body><h1>Index of /</h1><pre>\n");
    html.push_str("<a href=\"../\">Parent Directory</a>\n");
    for name in names {
        html.push_str(&format!("<a href=\"{name}\">{name}</a>\n"));
    }
    html.push_str("</pre></body></html>\n");
    html
}

/// Deterministic incompressible test data
pub fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}

pub fn write_file(path: PathBuf, data: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    path
}
