// src/error.rs

//! Error types for the package updater
//!
//! Variants are grouped by the stage that produces them: discovery,
//! transfer, installation and task orchestration. Callers branch on the
//! variant instead of matching message strings.

use crate::orchestrator::TaskFailure;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    /// Repository could not be scanned; other repositories are unaffected
    #[error("Problems processing repository {repository}: {message}")]
    DiscoveryError { repository: String, message: String },

    /// A metafile answered with HTTP 200 but could not be decoded
    #[error("Invalid repository metafile {url}: {message}")]
    MetafileError { url: String, message: String },

    #[error("{name}: md5sum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
        /// A full download was already retried before giving up
        retried: bool,
    },

    #[error("Failed to complete download of {url}, only {received} of {expected} bytes transferred")]
    IncompleteDownload {
        url: String,
        received: u64,
        expected: u64,
    },

    /// The delta transfer failed; a full download may still succeed
    #[error("Zsync of {url} failed: {message}")]
    ZsyncFailed {
        url: String,
        message: String,
        retried: bool,
    },

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error(
        "You have searched for a product, which was not found in configured repository: '{product_id}' (possible products: {})",
        available.join(", ")
    )]
    ProductNotFound {
        product_id: String,
        available: Vec<String>,
    },

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("No active repository configured")]
    NoActiveRepository,

    #[error("Task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("{count} errors during the processing of tasks")]
    TaskQueues {
        count: usize,
        failures: Vec<TaskFailure>,
    },
}

impl Error {
    /// Whether a full download is worth attempting after this error
    pub fn allows_full_download_retry(&self) -> bool {
        match self {
            Self::ZsyncFailed { retried, .. } | Self::ChecksumMismatch { retried, .. } => !retried,
            Self::IncompleteDownload { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::DownloadError(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::ConfigError(format!("Invalid regular expression: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_flag() {
        let err = Error::ZsyncFailed {
            url: "http://repo/x.opsi".to_string(),
            message: "SHA-1 mismatch".to_string(),
            retried: false,
        };
        assert!(err.allows_full_download_retry());

        let err = Error::ChecksumMismatch {
            name: "x".to_string(),
            expected: "a".to_string(),
            actual: "b".to_string(),
            retried: true,
        };
        assert!(!err.allows_full_download_retry());
        assert!(!Error::NoActiveRepository.allows_full_download_retry());
    }

    #[test]
    fn test_product_not_found_lists_candidates() {
        let err = Error::ProductNotFound {
            product_id: "foo".to_string(),
            available: vec!["hwaudit".to_string(), "swaudit".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("'foo'"));
        assert!(message.contains("hwaudit, swaudit"));
    }

    #[test]
    fn test_task_queue_summary() {
        let err = Error::TaskQueues {
            count: 3,
            failures: Vec::new(),
        };
        assert_eq!(err.to_string(), "3 errors during the processing of tasks");
    }
}
