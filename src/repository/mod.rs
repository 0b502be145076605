// src/repository/mod.rs

//! Repository discovery
//!
//! This module provides functionality for:
//! - Per-repository HTTP sessions (proxy, auth, client certificates)
//! - Reading repository metafiles (CBOR/JSON, optionally zstd compressed)
//! - Scraping directory listings when no metafile is published
//!
//! Both discovery paths produce the same [`PackageRecord`] type.

mod client;
mod metadata;
mod metafile;
mod scraper;

pub use client::{HttpSession, SessionSettings, TRANSFER_TIMEOUT};
pub use metadata::{IndexEntry, PackageRecord, RepositoryIndex, UrlList};
pub use metafile::{records_from_index, MetafileFormat, MetafileReader};
pub use scraper::{parse_directory_listing, parse_package_filename, LinkScraper};

use crate::config::RepositoryDescriptor;
use crate::error::Error;
use std::sync::Arc;
use tracing::{info, warn};

/// Packages and errors collected from one or more repositories
#[derive(Debug, Default)]
pub struct Discovery {
    pub packages: Vec<PackageRecord>,
    pub errors: Vec<Error>,
}

impl Discovery {
    fn merge(&mut self, other: Discovery) {
        self.packages.extend(other.packages);
        self.errors.extend(other.errors);
    }
}

/// Discovers available packages on configured repositories
///
/// The metafile cache lives as long as the scanner, so a run that scans
/// the same repository twice probes it once.
pub struct RepositoryScanner {
    settings: SessionSettings,
    metafiles: MetafileReader,
}

impl RepositoryScanner {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            metafiles: MetafileReader::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Discover the packages of one repository
    ///
    /// A metafile, when present, is authoritative; otherwise the
    /// directory listings are scraped.
    pub fn scan(&mut self, repo: &Arc<RepositoryDescriptor>) -> Discovery {
        info!("Getting package infos from repository '{}' ({})", repo.name, repo.base_url);

        let session = match HttpSession::for_repository(repo, &self.settings) {
            Ok(session) => session,
            Err(e) => return Self::failed(repo, e),
        };

        match self.metafiles.read(&session, repo) {
            Ok(Some(packages)) => Discovery {
                packages,
                errors: Vec::new(),
            },
            Ok(None) => {
                let (packages, errors) = LinkScraper::new(&session, repo).scan();
                Discovery {
                    packages,
                    errors: errors
                        .into_iter()
                        .map(|e| Error::DiscoveryError {
                            repository: repo.name.clone(),
                            message: e.to_string(),
                        })
                        .collect(),
                }
            }
            Err(e) => Self::failed(repo, e),
        }
    }

    /// Discover the packages of all given repositories
    pub fn scan_all(&mut self, repos: &[Arc<RepositoryDescriptor>]) -> Discovery {
        let mut discovery = Discovery::default();
        for repo in repos {
            discovery.merge(self.scan(repo));
        }
        discovery
    }

    fn failed(repo: &RepositoryDescriptor, error: Error) -> Discovery {
        warn!("Problems processing repository {}: {}", repo.name, error);
        Discovery {
            packages: Vec::new(),
            errors: vec![Error::DiscoveryError {
                repository: repo.name.clone(),
                message: error.to_string(),
            }],
        }
    }
}
