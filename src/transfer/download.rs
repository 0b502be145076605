// src/transfer/download.rs

//! Full package download
//!
//! Streams the response into a temporary file in the package directory
//! and moves it into place only when the transferred size matches the
//! announced `Content-Length`.

use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::repository::HttpSession;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Buffer size for streaming downloads (64 KiB)
const STREAM_BUFFER_SIZE: usize = 65536;

/// Stream a response body to `file`, reporting every chunk
fn stream_response_to_file(
    mut response: reqwest::blocking::Response,
    file: &mut impl Write,
    progress: &dyn ProgressTracker,
) -> Result<u64> {
    let mut downloaded: u64 = 0;
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];

    loop {
        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
        downloaded += bytes_read as u64;
        progress.increment(bytes_read as u64);
    }

    Ok(downloaded)
}

/// Download `url` to `dest`
///
/// Returns the number of bytes transferred. `dest` is left untouched on
/// failure.
pub fn download_package(
    session: &HttpSession,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressTracker,
) -> Result<u64> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| Error::IoError(format!("Failed to create directory {}: {e}", dir.display())))?;

    let response = session.send(url, || session.get_transfer(url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::DownloadError(format!("HTTP {status} from {url}")));
    }

    let expected = response.content_length();
    if let Some(size) = expected {
        progress.set_length(size);
    }
    info!(
        "Downloading {} ({:.2} MB) to {}",
        url,
        expected.unwrap_or(0) as f64 / 1_000_000.0,
        dest.display()
    );

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| Error::IoError(format!("Failed to create temporary file in {}: {e}", dir.display())))?;
    let received = match stream_response_to_file(response, tmp.as_file_mut(), progress) {
        Ok(received) => received,
        Err(e) => {
            progress.finish_with_error(&e.to_string());
            return Err(e);
        }
    };

    if let Some(expected) = expected {
        if received != expected {
            let err = Error::IncompleteDownload {
                url: url.to_string(),
                received,
                expected,
            };
            progress.finish_with_error(&err.to_string());
            return Err(err);
        }
    }

    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| {
        Error::IoError(format!("Failed to move download to {}: {}", dest.display(), e.error))
    })?;
    debug!("Downloaded {} bytes to {}", received, dest.display());
    progress.finish_with_message("download complete");

    Ok(received)
}
