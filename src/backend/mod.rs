// src/backend/mod.rs

//! Depot configuration service
//!
//! The updater talks to the depot's configuration service only through
//! the [`Backend`] trait. [`JsonRpcBackend`] is the production
//! implementation; tests use in-memory recorders.

mod jsonrpc;

pub use jsonrpc::JsonRpcBackend;

use crate::error::Result;
use crate::version::ProductVersion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// A product installed on a depot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledProduct {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
    pub depot_id: String,
}

impl InstalledProduct {
    pub fn version(&self) -> ProductVersion {
        ProductVersion::new(&self.product_version, &self.package_version)
    }
}

/// Product metadata relevant to post-install actions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductInfo {
    pub product_type: String,
    pub has_setup_script: bool,
}

impl ProductInfo {
    pub fn is_netboot(&self) -> bool {
        self.product_type.eq_ignore_ascii_case("NetbootProduct")
    }
}

/// Property default values passed to a package installation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDefaults(pub BTreeMap<String, Vec<Value>>);

impl PropertyDefaults {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A granted transfer slot
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSlot {
    pub slot_id: String,
    /// Seconds until the depot reclaims the slot unless renewed
    pub retention: Option<f64>,
}

/// Operations the updater needs from the configuration service
pub trait Backend: Send + Sync {
    /// Products currently installed on `depot_id`
    fn installed_products(&self, depot_id: &str) -> Result<Vec<InstalledProduct>>;

    /// Install a package file on the local depot
    fn install_package(
        &self,
        package: &Path,
        property_defaults: &PropertyDefaults,
        temp_dir: Option<&Path>,
    ) -> Result<()>;

    /// Remove a product from a depot
    fn uninstall_package(&self, depot_id: &str, product_id: &str) -> Result<()>;

    /// Property values configured for `product_id` on `object_id`
    fn product_property_defaults(&self, product_id: &str, object_id: &str) -> Result<PropertyDefaults>;

    /// Metadata of the product as installed on `depot_id`
    fn product_info(&self, depot_id: &str, product_id: &str) -> Result<Option<ProductInfo>>;

    /// Client ids assigned to `depot_id`
    fn clients_for_depot(&self, depot_id: &str) -> Result<Vec<String>>;

    /// Subset of `client_ids` with `product_id` installed
    fn clients_with_product_installed(&self, product_id: &str, client_ids: &[String]) -> Result<Vec<String>>;

    /// Set an action request on a client, e.g. `setup`
    fn set_product_action_request(&self, product_id: &str, client_id: &str, action: &str) -> Result<()>;

    /// Tell the configuration service to rebuild its product cache
    fn mark_product_cache_outdated(&self, depot_id: &str) -> Result<()>;

    /// Send wake-on-LAN to the given hosts
    fn power_on_hosts(&self, host_ids: &[String]) -> Result<()>;

    /// Acquire or renew a transfer slot on `depot_id` for `host_id`
    fn acquire_transfer_slot(
        &self,
        depot_id: &str,
        host_id: &str,
        slot_id: Option<&str>,
    ) -> Result<TransferSlot>;

    /// Release a previously acquired transfer slot
    fn release_transfer_slot(&self, depot_id: &str, host_id: &str, slot_id: &str) -> Result<()>;
}
