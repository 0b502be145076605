// src/hash.rs

//! Checksums for package integrity and delta transfer
//!
//! This module provides a unified interface for the hash algorithms the
//! updater needs:
//! - **MD5**: Package checksums advertised by repositories and stored in
//!   `.md5` sidecar files next to cached packages
//! - **SHA-1**: Whole-file hash declared in zsync control files
//!
//! The MD4 block checksums of the zsync format live in [`crate::zsync`],
//! they are never computed over whole files.

use md5::Md5;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5, used by opsi repositories and `.md5` sidecars
    #[default]
    Md5,
    /// SHA-1, used by zsync control files
    Sha1,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Incremental hasher over any supported algorithm
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(hasher) => hasher.update(data),
            HasherState::Sha1(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Md5(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha1(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Compute hash of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 65536];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute hash of a file, streaming its content
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(algorithm, &mut file)
}

/// MD5 of a file as lowercase hex
#[inline]
pub fn md5_file(path: &Path) -> io::Result<String> {
    hash_file(HashAlgorithm::Md5, path)
}

/// MD5 of a byte slice as lowercase hex
pub fn md5_bytes(data: &[u8]) -> String {
    let mut hasher = Hasher::new(HashAlgorithm::Md5);
    hasher.update(data);
    hasher.finalize()
}

// =============================================================================
// Sidecar files
// =============================================================================

static MD5_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z\d]{32})").unwrap());

/// Extract the first 32 character hex token from a `.md5` file body
///
/// Sidecars come in several flavors (`<hash>`, `<hash>  <file>`,
/// `MD5 (<file>) = <hash>`), so the token is searched instead of parsed.
pub fn extract_md5_token(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    MD5_TOKEN_RE
        .captures(&lowered)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Path of the `.md5` sidecar belonging to a package file
pub fn md5_sidecar_path(package: &Path) -> PathBuf {
    let mut name = package.as_os_str().to_os_string();
    name.push(".md5");
    PathBuf::from(name)
}

/// Read a package's `.md5` sidecar, if present and well-formed
pub fn read_md5_sidecar(package: &Path) -> Option<String> {
    let content = fs::read_to_string(md5_sidecar_path(package)).ok()?;
    extract_md5_token(&content)
}

/// Compute the package MD5 and store it in the `.md5` sidecar
///
/// The sidecar is written to a temporary file in the same directory and
/// renamed into place so readers never see a truncated checksum.
pub fn write_md5_sidecar(package: &Path) -> io::Result<String> {
    let digest = md5_file(package)?;
    let sidecar = md5_sidecar_path(package);
    let dir = sidecar.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(digest.as_bytes())?;
    tmp.persist(&sidecar).map_err(|e| e.error)?;
    Ok(digest)
}

// =============================================================================
// Verification functions
// =============================================================================

/// Verification result error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub expected: String,
    pub actual: String,
    pub algorithm: HashAlgorithm,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch: expected {}, got {}",
            self.algorithm, self.expected, self.actual
        )
    }
}

impl std::error::Error for VerifyError {}

/// Verify a file matches an expected hash
///
/// Streams the file content to avoid loading it entirely into memory.
pub fn verify_file(path: &Path, expected: &str, algorithm: HashAlgorithm) -> io::Result<Result<(), VerifyError>> {
    let actual = hash_file(algorithm, path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(Ok(()))
    } else {
        Ok(Err(VerifyError {
            expected: expected.to_string(),
            actual,
            algorithm,
        }))
    }
}
