// src/repository/metadata.rs

//! Repository metadata data structures
//!
//! Contains the package record shared by metafile and listing discovery,
//! and the serde schema of repository metafiles.

use crate::config::RepositoryDescriptor;
use crate::version::ProductVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A package available on a repository
///
/// Records are created fresh on every discovery pass and never persisted.
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub product_id: String,
    pub version: ProductVersion,
    /// Absolute URL of the `.opsi` file
    pub package_url: String,
    pub filename: String,
    /// Advertised MD5; `None` means the download cannot be verified
    pub md5sum: Option<String>,
    /// Absolute URL of the `.zsync` control file
    pub zsync_url: Option<String>,
    pub repository: Arc<RepositoryDescriptor>,
}

impl fmt::Display for PackageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.product_id, self.version)
    }
}

/// One or more URL paths advertised for a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl UrlList {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(url) => std::slice::from_ref(url),
            Self::Many(urls) => urls,
        }
    }
}

/// Package entry of a repository metafile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
    /// Package file paths relative to the repository base URL
    #[serde(default)]
    pub url: Option<UrlList>,
    #[serde(default, alias = "zsync_file")]
    pub zsync_url: Option<UrlList>,
    #[serde(default)]
    pub md5sum: Option<String>,
}

/// Repository metafile (`packages.json`, `packages.cbor`, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryIndex {
    /// Entries keyed by package name (`<productId>_<version>`)
    #[serde(default)]
    pub packages: BTreeMap<String, IndexEntry>,
}
