// src/zsync/range.rs

//! HTTP byte range requests
//!
//! Remote blocks are requested in batches with a multi-range `Range`
//! header. Servers answer with `multipart/byteranges` or, for a single
//! range, a plain 206 with `Content-Range`.

use super::patch::ByteRange;
use crate::error::{Error, Result};
use crate::repository::HttpSession;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use tracing::debug;

/// Maximum number of ranges in one request
pub const MAX_RANGES_PER_REQUEST: usize = 100;

/// Maximum number of bytes requested at once
pub const MAX_BYTES_PER_REQUEST: u64 = 64 * 1000 * 1000;

/// Split ranges into request batches
///
/// A single range larger than the byte limit is split on its own.
pub fn batch_ranges(ranges: &[ByteRange]) -> Vec<Vec<ByteRange>> {
    let mut batches: Vec<Vec<ByteRange>> = Vec::new();
    let mut current: Vec<ByteRange> = Vec::new();
    let mut current_bytes = 0u64;

    for range in ranges {
        let mut start = range.start;
        while start <= range.end {
            let end = range.end.min(start + MAX_BYTES_PER_REQUEST - 1);
            let piece = ByteRange { start, end };

            if !current.is_empty()
                && (current.len() >= MAX_RANGES_PER_REQUEST
                    || current_bytes + piece.len() > MAX_BYTES_PER_REQUEST)
            {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += piece.len();
            current.push(piece);
            start = end + 1;
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// `Range` header value for a batch
pub fn range_header(ranges: &[ByteRange]) -> String {
    let specs: Vec<String> = ranges.iter().map(|r| format!("{}-{}", r.start, r.end)).collect();
    format!("bytes={}", specs.join(", "))
}

/// Parse `bytes <start>-<end>/<total>`
pub fn parse_content_range(value: &str) -> Result<ByteRange> {
    let invalid = || Error::ParseError(format!("Invalid Content-Range '{value}'"));
    let spec = value.trim().strip_prefix("bytes").ok_or_else(invalid)?.trim();
    let span = spec.split('/').next().ok_or_else(invalid)?;
    let (start, end) = span.split_once('-').ok_or_else(invalid)?;
    let range = ByteRange {
        start: start.trim().parse().map_err(|_| invalid())?,
        end: end.trim().parse().map_err(|_| invalid())?,
    };
    if range.is_empty() {
        return Err(invalid());
    }
    Ok(range)
}

fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/byteranges") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a `multipart/byteranges` body into its parts
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<(ByteRange, Vec<u8>)>> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut pos = 0;

    while let Some(start) = find(body, delimiter.as_bytes(), pos) {
        let after = start + delimiter.len();
        if body[after..].starts_with(b"--") {
            break;
        }
        let headers_end = find(body, b"\r\n\r\n", after)
            .ok_or_else(|| Error::ParseError("Multipart part without header end".into()))?;
        let headers = String::from_utf8_lossy(&body[after..headers_end]);

        let range = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-range")
                    .then(|| value.trim().to_string())
            })
            .ok_or_else(|| Error::ParseError("Multipart part without Content-Range".into()))?;
        let range = parse_content_range(&range)?;

        let data_start = headers_end + 4;
        let data_end = usize::try_from(range.len())
            .ok()
            .and_then(|len| data_start.checked_add(len))
            .filter(|&end| end <= body.len())
            .ok_or_else(|| {
                Error::ParseError(format!("Multipart part {}-{} truncated", range.start, range.end))
            })?;
        parts.push((range, body[data_start..data_end].to_vec()));
        pos = data_end;
    }

    Ok(parts)
}

/// Fetch a batch of ranges and hand every received part to `sink`
///
/// Returns the number of bytes received.
pub fn fetch_ranges<F>(session: &HttpSession, url: &str, ranges: &[ByteRange], mut sink: F) -> Result<u64>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let header = range_header(ranges);
    debug!("Requesting {} ranges from {}", ranges.len(), url);
    let response = session.send(url, || session.get_transfer(url).header(RANGE, &header))?;

    let status = response.status();
    if status == StatusCode::OK {
        return Err(Error::DownloadError(format!(
            "{url} does not support range requests (HTTP 200 instead of 206)"
        )));
    }
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(Error::DownloadError(format!("HTTP {status} for range request to {url}")));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_range = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .map_err(|e| Error::DownloadError(format!("Failed to read range response from {url}: {e}")))?;

    let parts = match boundary_from_content_type(&content_type) {
        Some(boundary) => parse_multipart(&body, &boundary)?,
        None => {
            let range = content_range
                .as_deref()
                .ok_or_else(|| Error::DownloadError(format!("Range response from {url} without Content-Range")))
                .and_then(parse_content_range)?;
            if body.len() as u64 != range.len() {
                return Err(Error::IncompleteDownload {
                    url: url.to_string(),
                    received: body.len() as u64,
                    expected: range.len(),
                });
            }
            vec![(range, body.to_vec())]
        }
    };

    let requested: u64 = ranges.iter().map(ByteRange::len).sum();
    let mut received = 0u64;
    for (range, data) in &parts {
        sink(range.start, data)?;
        received += data.len() as u64;
    }
    if received < requested {
        return Err(Error::IncompleteDownload {
            url: url.to_string(),
            received,
            expected: requested,
        });
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange { start, end }
    }

    #[test]
    fn test_range_header() {
        assert_eq!(
            range_header(&[r(0, 8191), r(16384, 24575)]),
            "bytes=0-8191, 16384-24575"
        );
    }

    #[test]
    fn test_batch_ranges_limits() {
        let many: Vec<ByteRange> = (0..250).map(|i| r(i * 10, i * 10 + 4)).collect();
        let batches = batch_ranges(&many);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), MAX_RANGES_PER_REQUEST);
        assert_eq!(batches[2].len(), 50);

        let big = batch_ranges(&[r(0, MAX_BYTES_PER_REQUEST * 2 + 9)]);
        assert_eq!(big.len(), 3);
        assert_eq!(big[0], vec![r(0, MAX_BYTES_PER_REQUEST - 1)]);
        assert_eq!(big[2], vec![r(MAX_BYTES_PER_REQUEST * 2, MAX_BYTES_PER_REQUEST * 2 + 9)]);
    }

    #[test]
    fn test_oversized_part_is_rejected() {
        let body = b"--B\r\nContent-Range: bytes 0-18446744073709551614/18446744073709551615\r\n\r\nabc\r\n--B--\r\n";
        assert!(matches!(parse_multipart(body, "B"), Err(Error::ParseError(_))));

        let body = b"--B\r\nContent-Range: bytes 0-18446744073709551615/*\r\n\r\nabc\r\n--B--\r\n";
        assert!(matches!(parse_multipart(body, "B"), Err(Error::ParseError(_))));
        assert_eq!(r(0, u64::MAX).len(), u64::MAX);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 100-199/1000").unwrap(), r(100, 199));
        assert_eq!(parse_content_range("bytes 5-5/*").unwrap(), r(5, 5));
        assert!(parse_content_range("bytes */1000").is_err());
        assert!(parse_content_range("items 1-2/3").is_err());
    }

    #[test]
    fn test_parse_multipart() {
        let mut body = Vec::new();
        body.extend_from_slice(b"\r\n--THIS_STRING_SEPARATES\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 0-3/100\r\n\r\n");
        body.extend_from_slice(b"\r\n--");
        body.extend_from_slice(b"\r\n--THIS_STRING_SEPARATES\r\nContent-Range: bytes 50-51/100\r\n\r\n");
        body.extend_from_slice(b"xy");
        body.extend_from_slice(b"\r\n--THIS_STRING_SEPARATES--\r\n");

        let parts = parse_multipart(&body, "THIS_STRING_SEPARATES").unwrap();
        assert_eq!(parts.len(), 2);
        // Part data may itself look like a delimiter
        assert_eq!(parts[0], (r(0, 3), b"\r\n--".to_vec()));
        assert_eq!(parts[1], (r(50, 51), b"xy".to_vec()));
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/byteranges; boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(boundary_from_content_type("application/octet-stream"), None);
    }
}
