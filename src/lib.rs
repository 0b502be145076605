// src/lib.rs

//! opsi Package Updater
//!
//! Keeps the package directory of an opsi depot server in sync with
//! configured package repositories and installs what is new.
//!
//! # Architecture
//!
//! - Discovery: repository metafiles (CBOR/JSON, optionally zstd) with a
//!   directory listing scraper as fallback
//! - Policy: install and download decisions, newest-version selection,
//!   installation window and dependency ordering
//! - Transfer: zsync delta transfer against the previous local package,
//!   full download as fallback, MD5 verification
//! - Orchestration: per-depot task queues with a bounded number of
//!   concurrent uploads and transfer slots kept alive by a heartbeat

pub mod backend;
pub mod config;
mod error;
pub mod hash;
pub mod inspect;
pub mod notify;
pub mod orchestrator;
pub mod policy;
pub mod progress;
pub mod repository;
pub mod transfer;
pub mod updater;
pub mod version;
pub mod zsync;

pub use backend::{Backend, InstalledProduct, JsonRpcBackend};
pub use config::{RepositoryDescriptor, UpdaterConfig};
pub use error::{Error, Result};
pub use progress::{LogProgress, ProgressMode, ProgressTracker, SilentProgress};
pub use repository::{PackageRecord, RepositoryScanner};
pub use transfer::TransferEngine;
pub use updater::{PackageUpdater, Update};
pub use version::ProductVersion;
