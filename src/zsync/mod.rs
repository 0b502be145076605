// src/zsync/mod.rs

//! zsync delta transfer
//!
//! Rebuilds a package from local files that share content with it,
//! fetching only the missing blocks with HTTP range requests:
//!
//! 1. Parse the `.zsync` control file of the target
//! 2. Scan local sources for matching blocks ([`patch::plan`])
//! 3. Fetch remote ranges in batches ([`range::fetch_ranges`])
//! 4. Copy local blocks, verify the SHA-1 and move the result into place

pub mod control;
pub mod patch;
pub mod range;
pub mod rsum;

pub use control::{write_control_file, zsync_sidecar_path, ControlFile};
pub use patch::{plan, ByteRange, CircuitBreaker, Instruction, PatchPlan};

use crate::error::{Error, Result};
use crate::hash::{hash_file, HashAlgorithm};
use crate::progress::ProgressTracker;
use crate::repository::HttpSession;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Suffix of the file the target is assembled in
pub const TMP_SUFFIX: &str = ".zsync-tmp";

/// Suffix of a downloaded control file
pub const CONTROL_DOWNLOAD_SUFFIX: &str = ".zsync-download";

/// Outcome of a delta transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZsyncStats {
    pub local_bytes: u64,
    pub remote_bytes: u64,
}

impl ZsyncStats {
    /// Share of the target taken from local files, in percent
    pub fn local_percent(&self) -> f64 {
        let total = self.local_bytes + self.remote_bytes;
        if total == 0 {
            return 100.0;
        }
        self.local_bytes as f64 * 100.0 / total as f64
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    name.into()
}

/// Local files worth scanning when rebuilding `target`
///
/// The target itself (usually an older version renamed to the new name)
/// and leftovers of interrupted transfers. A leftover at the assembly
/// path is moved aside first so it can be read while the new file is
/// written.
pub fn collect_sources(target: &Path) -> Result<Vec<PathBuf>> {
    let tmp = with_suffix(target, TMP_SUFFIX);
    if tmp.exists() {
        let aside = with_suffix(target, &format!("{TMP_SUFFIX}.prev"));
        fs::rename(&tmp, &aside)?;
    }

    let mut sources = Vec::new();
    if target.is_file() {
        sources.push(target.to_path_buf());
    }

    let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
        return Ok(sources);
    };
    let prefix = format!("{}{}", name.to_string_lossy(), TMP_SUFFIX);
    let mut leftovers: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    leftovers.sort();
    sources.extend(leftovers);
    Ok(sources)
}

/// Download a control file into `<target>.zsync-download` and parse it
pub fn fetch_control_file(session: &HttpSession, url: &str, target: &Path) -> Result<ControlFile> {
    let download = with_suffix(target, CONTROL_DOWNLOAD_SUFFIX);
    let (status, body) = session.fetch(url)?;
    if !status.is_success() {
        return Err(Error::DownloadError(format!("HTTP {status} from {url}")));
    }
    fs::write(&download, &body)?;
    let control = ControlFile::parse(&fs::read(&download)?);
    if let Err(e) = fs::remove_file(&download) {
        debug!("Failed to remove {}: {}", download.display(), e);
    }
    control
}

/// Rebuild `target` from local sources plus ranges of `package_url`
///
/// Errors are reported as [`Error::ZsyncFailed`] so callers can fall back
/// to a full download.
pub fn sync_file(
    session: &HttpSession,
    control_url: &str,
    package_url: &str,
    target: &Path,
    breaker: &mut CircuitBreaker,
    progress: &dyn ProgressTracker,
) -> Result<ZsyncStats> {
    sync_file_inner(session, control_url, package_url, target, breaker, progress).map_err(|e| match e {
        Error::ZsyncFailed { .. } => e,
        other => Error::ZsyncFailed {
            url: package_url.to_string(),
            message: other.to_string(),
            retried: false,
        },
    })
}

fn sync_file_inner(
    session: &HttpSession,
    control_url: &str,
    package_url: &str,
    target: &Path,
    breaker: &mut CircuitBreaker,
    progress: &dyn ProgressTracker,
) -> Result<ZsyncStats> {
    let control = fetch_control_file(session, control_url, target)?;
    info!(
        "Zsync of {}: {} bytes in {} blocks of {}",
        package_url,
        control.length,
        control.block_count(),
        control.blocksize
    );

    let sources = collect_sources(target)?;
    let plan = plan(&control, &sources, breaker)?;
    let stats = ZsyncStats {
        local_bytes: plan.local_bytes(),
        remote_bytes: plan.remote_bytes(),
    };
    info!(
        "{:.1}% of {} available locally, fetching {} bytes",
        stats.local_percent(),
        package_url,
        stats.remote_bytes
    );
    progress.set_length(control.length);

    let tmp = with_suffix(target, TMP_SUFFIX);
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    out.set_len(control.length)?;

    for batch in range::batch_ranges(&plan.remote_ranges()) {
        range::fetch_ranges(session, package_url, &batch, |offset, data| {
            write_at(&mut out, offset, data)?;
            progress.increment(data.len() as u64);
            Ok(())
        })?;
    }

    for instruction in &plan.instructions {
        if let Instruction::Local {
            source,
            source_offset,
            target_offset,
            size,
        } = *instruction
        {
            copy_local(&plan.sources[source], source_offset, &mut out, target_offset, size)?;
            progress.increment(size);
        }
    }
    out.sync_all()?;
    drop(out);

    if let Some(expected) = &control.sha1 {
        let actual = hash_file(HashAlgorithm::Sha1, &tmp)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::ZsyncFailed {
                url: package_url.to_string(),
                message: format!("SHA-1 mismatch (expected {expected}, got {actual})"),
                retried: false,
            });
        }
    }

    fs::rename(&tmp, target)?;
    progress.finish_with_message("zsync complete");
    Ok(stats)
}

fn write_at(out: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    out.seek(SeekFrom::Start(offset))?;
    out.write_all(data)?;
    Ok(())
}

fn copy_local(source: &Path, source_offset: u64, out: &mut File, target_offset: u64, size: u64) -> io::Result<()> {
    let mut input = File::open(source)?;
    input.seek(SeekFrom::Start(source_offset))?;
    out.seek(SeekFrom::Start(target_offset))?;
    let copied = io::copy(&mut input.take(size), out)?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} shorter than expected", source.display()),
        ));
    }
    Ok(())
}
