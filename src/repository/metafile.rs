// src/repository/metafile.rs

//! Repository metafile discovery
//!
//! A repository may publish a package index next to its directories. The
//! reader probes a fixed list of names below the base URL; the first one
//! answering HTTP 200 is decoded. Results (including "no metafile") are
//! cached per base URL for the lifetime of the reader.

use super::client::HttpSession;
use super::metadata::{IndexEntry, PackageRecord, RepositoryIndex};
use crate::config::RepositoryDescriptor;
use crate::error::{Error, Result};
use crate::version::ProductVersion;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Encodings a metafile may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetafileFormat {
    CborZstd,
    Cbor,
    Json,
    JsonZstd,
}

impl MetafileFormat {
    /// Probe order; the first name answering 200 wins
    pub const PROBE_ORDER: [MetafileFormat; 4] = [
        MetafileFormat::CborZstd,
        MetafileFormat::Cbor,
        MetafileFormat::Json,
        MetafileFormat::JsonZstd,
    ];

    pub fn filename(self) -> &'static str {
        match self {
            Self::CborZstd => "packages.cbor.zstd",
            Self::Cbor => "packages.cbor",
            Self::Json => "packages.json",
            Self::JsonZstd => "packages.json.zstd",
        }
    }

    fn is_compressed(self) -> bool {
        matches!(self, Self::CborZstd | Self::JsonZstd)
    }

    /// Decode a metafile body; an empty body is an empty index
    pub fn decode(self, body: &[u8]) -> std::result::Result<RepositoryIndex, String> {
        if body.is_empty() {
            return Ok(RepositoryIndex::default());
        }

        let data = if self.is_compressed() {
            zstd::decode_all(body).map_err(|e| format!("zstd decompression failed: {e}"))?
        } else {
            body.to_vec()
        };
        if data.is_empty() {
            return Ok(RepositoryIndex::default());
        }

        match self {
            Self::CborZstd | Self::Cbor => {
                ciborium::from_reader(data.as_slice()).map_err(|e| format!("invalid CBOR: {e}"))
            }
            Self::Json | Self::JsonZstd => {
                serde_json::from_slice(&data).map_err(|e| format!("invalid JSON: {e}"))
            }
        }
    }
}

/// Reads and caches repository metafiles
#[derive(Debug, Default)]
pub struct MetafileReader {
    cache: HashMap<String, Option<RepositoryIndex>>,
}

impl MetafileReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the metafile of `repo`
    ///
    /// Returns `Ok(None)` when no probe answered 200. Decoding failures of a
    /// 200 response are errors.
    pub fn fetch(&mut self, session: &HttpSession, repo: &RepositoryDescriptor) -> Result<Option<&RepositoryIndex>> {
        let base_url = repo.base_url.clone();
        if !self.cache.contains_key(&base_url) {
            let index = probe(session, &base_url)?;
            self.cache.insert(base_url.clone(), index);
        } else {
            debug!("Using cached metafile result for {}", base_url);
        }
        Ok(self.cache.get(&base_url).and_then(Option::as_ref))
    }

    /// Package records from the metafile of `repo`, `None` if it has none
    pub fn read(&mut self, session: &HttpSession, repo: &Arc<RepositoryDescriptor>) -> Result<Option<Vec<PackageRecord>>> {
        Ok(self
            .fetch(session, repo)?
            .map(|index| records_from_index(index, repo)))
    }
}

fn probe(session: &HttpSession, base_url: &str) -> Result<Option<RepositoryIndex>> {
    for format in MetafileFormat::PROBE_ORDER {
        let url = format!("{}/{}", base_url, format.filename());
        debug!("Probing metafile {}", url);
        let (status, body) = session.fetch(&url)?;
        if status != StatusCode::OK {
            debug!("Metafile {} not available: HTTP {}", url, status);
            continue;
        }

        let index = format
            .decode(&body)
            .map_err(|message| Error::MetafileError { url: url.clone(), message })?;
        info!("Using metafile {} with {} packages", url, index.packages.len());
        return Ok(Some(index));
    }
    Ok(None)
}

/// Normalize a POSIX path: drop empty and `.` segments, resolve `..`
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts.join("/")
}

/// Whether a path relative to the base URL lies under one of `dirs`
fn path_in_dirs(path: &str, dirs: &[String]) -> bool {
    let path = normalize_path(path);
    dirs.iter().any(|dir| {
        let dir = normalize_path(dir);
        dir.is_empty() || path.starts_with(&format!("{dir}/"))
    })
}

/// Make `url` relative to `base_url` if it points below it
fn relative_to_base<'a>(url: &'a str, base_url: &str) -> &'a str {
    url.strip_prefix(base_url)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(url)
        .trim_start_matches('/')
}

fn absolute_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!("{}/{}", base_url, normalize_path(path))
    }
}

fn record_from_entry(key: &str, entry: &IndexEntry, repo: &Arc<RepositoryDescriptor>) -> Option<PackageRecord> {
    let default_url = [format!("{key}.opsi")];
    let urls = entry.url.as_ref().map_or(&default_url[..], |u| u.as_slice());

    let Some(path) = urls
        .iter()
        .map(|u| relative_to_base(u, &repo.base_url))
        .find(|p| path_in_dirs(p, &repo.dirs))
    else {
        debug!("Skipping metafile entry {}: not in configured dirs", key);
        return None;
    };

    let filename = path.rsplit('/').next().unwrap_or(path).to_string();
    if !repo.accepts(&filename) {
        return None;
    }

    let zsync_url = entry
        .zsync_url
        .as_ref()
        .and_then(|z| z.as_slice().first())
        .map(|z| absolute_url(&repo.base_url, relative_to_base(z, &repo.base_url)));

    let package_url = absolute_url(&repo.base_url, path);
    info!("Found opsi package: {}", package_url);
    Some(PackageRecord {
        product_id: entry.product_id.to_lowercase(),
        version: ProductVersion::new(&entry.product_version, &entry.package_version),
        package_url,
        filename,
        md5sum: entry.md5sum.as_ref().map(|m| m.to_lowercase()).filter(|m| !m.is_empty()),
        zsync_url,
        repository: Arc::clone(repo),
    })
}

/// Convert a decoded index into package records of `repo`
pub fn records_from_index(index: &RepositoryIndex, repo: &Arc<RepositoryDescriptor>) -> Vec<PackageRecord> {
    index
        .packages
        .iter()
        .filter_map(|(key, entry)| record_from_entry(key, entry, repo))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo(dirs: &[&str]) -> Arc<RepositoryDescriptor> {
        let mut repo = RepositoryDescriptor::new("test", "https://repo.example/opsi");
        repo.dirs = dirs.iter().map(|d| d.to_string()).collect();
        Arc::new(repo)
    }

    fn index() -> RepositoryIndex {
        serde_json::from_value(json!({
            "packages": {
                "hwaudit_4.2.0.0-1": {
                    "product_id": "hwaudit",
                    "product_version": "4.2.0.0",
                    "package_version": "1",
                    "url": "stable/windows/hwaudit_4.2.0.0-1.opsi",
                    "zsync_url": "stable/windows/hwaudit_4.2.0.0-1.opsi.zsync",
                    "md5sum": "5EB63BBBE01EEED093CB22BB8F5ACDC3"
                },
                "l-os_1.0-3": {
                    "product_id": "l-os",
                    "product_version": "1.0",
                    "package_version": "3",
                    "url": ["testing/linux/l-os_1.0-3.opsi", "stable/linux/l-os_1.0-3.opsi"]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_empty_body() {
        for format in MetafileFormat::PROBE_ORDER {
            assert!(format.decode(b"").unwrap().packages.is_empty());
        }
    }

    #[test]
    fn test_decode_formats() {
        let index = index();
        let json_bytes = serde_json::to_vec(&index).unwrap();
        let mut cbor_bytes = Vec::new();
        ciborium::into_writer(&index, &mut cbor_bytes).unwrap();
        let compressed = zstd::encode_all(cbor_bytes.as_slice(), 3).unwrap();

        assert_eq!(MetafileFormat::Json.decode(&json_bytes).unwrap().packages.len(), 2);
        assert_eq!(MetafileFormat::Cbor.decode(&cbor_bytes).unwrap().packages.len(), 2);
        assert_eq!(MetafileFormat::CborZstd.decode(&compressed).unwrap().packages.len(), 2);
        assert!(MetafileFormat::Json.decode(b"{not json").is_err());
        assert!(MetafileFormat::JsonZstd.decode(b"plain").is_err());
    }

    #[test]
    fn test_records_filtered_by_dirs() {
        let records = records_from_index(&index(), &repo(&["stable/windows"]));
        assert_eq!(records.len(), 1);
        let hwaudit = &records[0];
        assert_eq!(hwaudit.product_id, "hwaudit");
        assert_eq!(hwaudit.filename, "hwaudit_4.2.0.0-1.opsi");
        assert_eq!(
            hwaudit.package_url,
            "https://repo.example/opsi/stable/windows/hwaudit_4.2.0.0-1.opsi"
        );
        assert_eq!(hwaudit.md5sum.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(
            hwaudit.zsync_url.as_deref(),
            Some("https://repo.example/opsi/stable/windows/hwaudit_4.2.0.0-1.opsi.zsync")
        );

        // The second candidate URL matches the configured dir
        let records = records_from_index(&index(), &repo(&["./stable/linux/"]));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].package_url, "https://repo.example/opsi/stable/linux/l-os_1.0-3.opsi");

        // The base dir accepts everything
        assert_eq!(records_from_index(&index(), &repo(&["/"])).len(), 2);
    }

    #[test]
    fn test_dir_prefix_is_path_based() {
        assert!(path_in_dirs("stable/windows/a.opsi", &["stable".to_string()]));
        assert!(!path_in_dirs("stable-old/a.opsi", &["stable".to_string()]));
        assert!(path_in_dirs("/stable//./windows/a.opsi", &["stable/windows/".to_string()]));
    }

    #[test]
    fn test_missing_url_uses_key() {
        let index: RepositoryIndex = serde_json::from_value(json!({
            "packages": {"swaudit_1.0-2": {
                "product_id": "swaudit", "product_version": "1.0", "package_version": "2"
            }}
        }))
        .unwrap();
        let records = records_from_index(&index, &repo(&["/"]));
        assert_eq!(records[0].filename, "swaudit_1.0-2.opsi");
        assert!(records[0].md5sum.is_none());
    }
}
