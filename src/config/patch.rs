// src/config/patch.rs

//! Rewrite legacy uib repository definitions
//!
//! Repository files shipped with older opsi releases point at
//! `download.uib.de` with `opsi4.x/<stage>/packages/<os>/<type>/`
//! directories. Those are rewritten to the current package server layout
//! (`<stage>/<os>/<type>/`). Only the shipped repository files are
//! touched; comment lines and all other values stay byte-identical.

use crate::error::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

/// Repository files installed by opsi packages
pub const KNOWN_REPO_FILES: &[&str] = &[
    "experimental.repo",
    "testing.repo",
    "uib-linux.repo",
    "uib-local_image.repo",
    "uib-macos.repo",
    "uib-windows.repo",
    "uib-tools.repo",
];

const CURRENT_BASE_URL: &str = "https://opsipackages.43.opsi.org";

static LEGACY_BASE_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://download\.uib\.de/?$").unwrap());

static LEGACY_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^opsi4\.\d+/([^/]+)/packages/(.+)$").unwrap());

/// Marker written at the top of every rewritten file
pub fn patch_marker() -> String {
    format!(
        "; This file has been patched by opsi-package-updater {}",
        env!("CARGO_PKG_VERSION")
    )
}

/// Rewrite one `key = value` line, returning `None` if it is unchanged
fn patch_line(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.starts_with(';') || trimmed.starts_with('#') {
        return None;
    }
    let (key_part, value_part) = line.split_once('=')?;
    let key = key_part.trim();
    let value = value_part.trim();

    let new_value = if key.eq_ignore_ascii_case("baseUrl") {
        LEGACY_BASE_URL_RE
            .is_match(value)
            .then(|| CURRENT_BASE_URL.to_string())?
    } else if key.eq_ignore_ascii_case("dirs") {
        let dirs: Vec<&str> = value.split(',').map(str::trim).filter(|d| !d.is_empty()).collect();
        if !dirs.iter().any(|d| LEGACY_DIR_RE.is_match(d)) {
            return None;
        }
        dirs.iter()
            .map(|d| LEGACY_DIR_RE.replace(d, "$1/$2").into_owned())
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        return None;
    };

    Some(format!("{} = {new_value}", key_part.trim_end()))
}

/// Patch the content of a repository file, `None` if nothing matched
pub fn patch_repo_content(content: &str) -> Option<String> {
    let mut changed = false;
    let mut output = String::with_capacity(content.len() + 64);
    output.push_str(&patch_marker());
    output.push('\n');

    for line in content.split_inclusive('\n') {
        let (body, ending) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        match patch_line(body) {
            Some(patched) => {
                changed = true;
                output.push_str(&patched);
                output.push_str(ending);
            }
            None => output.push_str(line),
        }
    }

    changed.then_some(output)
}

/// Patch a single repository file in place, returning whether it changed
pub fn patch_repo_file(path: &Path) -> Result<bool> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;

    let Some(patched) = patch_repo_content(&content) else {
        debug!("Repository file {} needs no patching", path.display());
        return Ok(false);
    };

    fs::write(path, patched)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", path.display())))?;
    info!("Patched legacy repository file {}", path.display());
    Ok(true)
}

/// Patch all known uib repository files in a directory
pub fn patch_repo_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut patched = Vec::new();
    for name in KNOWN_REPO_FILES {
        let path = dir.join(name);
        if path.is_file() && patch_repo_file(&path)? {
            patched.push(path);
        }
    }
    Ok(patched)
}
