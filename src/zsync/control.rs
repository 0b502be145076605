// src/zsync/control.rs

//! zsync control files
//!
//! A control file is a block of `Key: value` header lines, an empty line,
//! and one checksum record per block of the target file: the trailing
//! `rsum_bytes` of the rolling checksum followed by the leading
//! `checksum_bytes` of the MD4 of the zero-padded block.

use super::rsum::{key_from_bytes, Rsum};
use crate::error::{Error, Result};
use crate::hash::{hash_file, HashAlgorithm};
use chrono::{DateTime, Utc};
use md4::{Digest, Md4};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

pub const ZSYNC_VERSION: &str = "0.6.2";

/// Files at least this large use the larger block size
const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Block size used when generating a control file for `length` bytes
pub fn default_blocksize(length: u64) -> usize {
    if length >= LARGE_FILE_THRESHOLD {
        4096
    } else {
        2048
    }
}

/// Checksums of one target block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSum {
    /// Truncated rolling checksum as lookup key
    pub rsum: u32,
    /// Truncated MD4
    pub checksum: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    pub version: String,
    pub filename: Option<String>,
    pub mtime: Option<String>,
    pub blocksize: usize,
    pub length: u64,
    pub seq_matches: usize,
    pub rsum_bytes: usize,
    pub checksum_bytes: usize,
    pub url: Option<String>,
    /// Hex SHA-1 of the complete target file
    pub sha1: Option<String>,
    pub blocks: Vec<BlockSum>,
}

impl ControlFile {
    /// Number of blocks covering `length`
    pub fn block_count(&self) -> usize {
        self.length.div_ceil(self.blocksize as u64) as usize
    }

    /// Offset and size of block `index` in the target file
    pub fn block_span(&self, index: usize) -> (u64, u64) {
        let offset = index as u64 * self.blocksize as u64;
        let size = (self.length - offset).min(self.blocksize as u64);
        (offset, size)
    }

    /// Truncated MD4 of a block, zero-padded to the block size
    pub fn strong_checksum(&self, block: &[u8]) -> Vec<u8> {
        strong_checksum(block, self.blocksize, self.checksum_bytes)
    }

    /// Parse a control file
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = BufReader::new(data);
        let mut control = ControlFile {
            version: String::new(),
            filename: None,
            mtime: None,
            blocksize: 0,
            length: 0,
            seq_matches: 1,
            rsum_bytes: 4,
            checksum_bytes: 16,
            url: None,
            sha1: None,
            blocks: Vec::new(),
        };

        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::ParseError(format!("zsync header: {e}")))?;
            if read == 0 {
                return Err(Error::ParseError("zsync control file has no block checksums".into()));
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }
            let Some((key, value)) = text.split_once(':') else {
                return Err(Error::ParseError(format!("Invalid zsync header line '{text}'")));
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "zsync" => control.version = value,
                "filename" => control.filename = Some(value),
                "mtime" => control.mtime = Some(value),
                "blocksize" => control.blocksize = parse_number(key, &value)?,
                "length" => control.length = parse_number(key, &value)?,
                "hash-lengths" => {
                    let parts: Vec<usize> = value
                        .split(',')
                        .map(|p| parse_number(key, p.trim()))
                        .collect::<Result<_>>()?;
                    let &[seq, rsum, checksum] = parts.as_slice() else {
                        return Err(Error::ParseError(format!("Invalid Hash-Lengths '{value}'")));
                    };
                    control.seq_matches = seq;
                    control.rsum_bytes = rsum;
                    control.checksum_bytes = checksum;
                }
                "url" => control.url = Some(value),
                "sha-1" => control.sha1 = Some(value.to_lowercase()),
                other => debug!("Ignoring zsync header '{}'", other),
            }
        }

        if control.blocksize == 0 || !control.blocksize.is_power_of_two() {
            return Err(Error::ParseError(format!(
                "Invalid zsync block size {}",
                control.blocksize
            )));
        }
        if !(1..=2).contains(&control.seq_matches)
            || !(1..=4).contains(&control.rsum_bytes)
            || !(3..=16).contains(&control.checksum_bytes)
        {
            return Err(Error::ParseError(format!(
                "Unsupported zsync hash lengths {},{},{}",
                control.seq_matches, control.rsum_bytes, control.checksum_bytes
            )));
        }

        let record = control.rsum_bytes + control.checksum_bytes;
        let mut buf = vec![0u8; record];
        for index in 0..control.block_count() {
            reader.read_exact(&mut buf).map_err(|e| {
                Error::ParseError(format!("zsync checksums truncated at block {index}: {e}"))
            })?;
            control.blocks.push(BlockSum {
                rsum: key_from_bytes(&buf[..control.rsum_bytes]),
                checksum: buf[control.rsum_bytes..].to_vec(),
            });
        }

        Ok(control)
    }

    /// Compute a control file for the file at `path`
    pub fn generate(path: &Path, url: Option<&str>) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let length = metadata.len();
        let blocksize = default_blocksize(length);
        let mtime = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).format("%a, %d %b %Y %H:%M:%S %z").to_string());

        let mut control = ControlFile {
            version: ZSYNC_VERSION.to_string(),
            filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            mtime,
            blocksize,
            length,
            seq_matches: 1,
            rsum_bytes: 4,
            checksum_bytes: 16,
            url: url.map(str::to_string),
            sha1: Some(hash_file(HashAlgorithm::Sha1, path)?),
            blocks: Vec::new(),
        };

        let mut file = BufReader::new(File::open(path)?);
        let mut block = vec![0u8; blocksize];
        for index in 0..control.block_count() {
            let (_, size) = control.block_span(index);
            let size = size as usize;
            file.read_exact(&mut block[..size])?;
            block[size..].fill(0);
            control.blocks.push(BlockSum {
                rsum: Rsum::compute(&block).key(control.rsum_bytes),
                checksum: strong_checksum(&block, blocksize, control.checksum_bytes),
            });
        }

        Ok(control)
    }

    /// Serialize the control file
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "zsync: {}", self.version)?;
        if let Some(filename) = &self.filename {
            writeln!(out, "Filename: {filename}")?;
        }
        if let Some(mtime) = &self.mtime {
            writeln!(out, "MTime: {mtime}")?;
        }
        writeln!(out, "Blocksize: {}", self.blocksize)?;
        writeln!(out, "Length: {}", self.length)?;
        writeln!(
            out,
            "Hash-Lengths: {},{},{}",
            self.seq_matches, self.rsum_bytes, self.checksum_bytes
        )?;
        if let Some(url) = &self.url {
            writeln!(out, "URL: {url}")?;
        }
        if let Some(sha1) = &self.sha1 {
            writeln!(out, "SHA-1: {sha1}")?;
        }
        writeln!(out)?;

        for block in &self.blocks {
            let rsum = block.rsum.to_be_bytes();
            out.write_all(&rsum[4 - self.rsum_bytes..])?;
            out.write_all(&block.checksum[..self.checksum_bytes])?;
        }
        Ok(())
    }
}

/// Truncated MD4 of `block` zero-padded to `blocksize`
pub fn strong_checksum(block: &[u8], blocksize: usize, checksum_bytes: usize) -> Vec<u8> {
    let mut hasher = Md4::new();
    hasher.update(block);
    if block.len() < blocksize {
        hasher.update(vec![0u8; blocksize - block.len()]);
    }
    hasher.finalize()[..checksum_bytes].to_vec()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::ParseError(format!("Invalid zsync {key} '{value}'")))
}

/// Generate `<package>.zsync` next to a package file
pub fn write_control_file(package: &Path) -> Result<()> {
    let control = ControlFile::generate(package, control_url(package).as_deref())?;
    let dest = zsync_sidecar_path(package);
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    control.write_to(&mut tmp)?;
    tmp.persist(&dest)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", dest.display())))?;
    debug!("Wrote zsync control file {}", dest.display());
    Ok(())
}

/// The package file name, as referenced from its control file
fn control_url(package: &Path) -> Option<String> {
    package.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Path of the `.zsync` sidecar of a package
pub fn zsync_sidecar_path(package: &Path) -> std::path::PathBuf {
    let mut name = package.as_os_str().to_os_string();
    name.push(".zsync");
    name.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_blocksize() {
        assert_eq!(default_blocksize(0), 2048);
        assert_eq!(default_blocksize(100 * 1024 * 1024 - 1), 2048);
        assert_eq!(default_blocksize(100 * 1024 * 1024), 4096);
    }

    #[test]
    fn test_generate_and_parse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hwaudit_4.2.0.0-1.opsi");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        write_control_file(&path).unwrap();
        let bytes = fs::read(zsync_sidecar_path(&path)).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("zsync: 0.6.2\nFilename: hwaudit_4.2.0.0-1.opsi\n"));
        assert!(text.contains("Blocksize: 2048\nLength: 5000\nHash-Lengths: 1,4,16\n"));

        let control = ControlFile::parse(&bytes).unwrap();
        assert_eq!(control.block_count(), 3);
        assert_eq!(control.blocks.len(), 3);
        assert_eq!(control.block_span(2), (4096, 904));
        assert_eq!(
            control.sha1.as_deref(),
            Some(hash_file(HashAlgorithm::Sha1, &path).unwrap().as_str())
        );

        // The last block is zero-padded before hashing
        let mut padded = data[4096..].to_vec();
        padded.resize(2048, 0);
        assert_eq!(control.blocks[2].rsum, Rsum::compute(&padded).key(4));
        assert_eq!(control.blocks[2].checksum, strong_checksum(&data[4096..], 2048, 16));
    }

    #[test]
    fn test_parse_short_hash_lengths() {
        let mut data = b"zsync: 0.6.2\nBlocksize: 2048\nLength: 3000\nHash-Lengths: 2,2,5\nX-Unknown: 1\n\n".to_vec();
        data.extend_from_slice(&[0x00, 0x0a, 1, 2, 3, 4, 5]);
        data.extend_from_slice(&[0xab, 0xcd, 6, 7, 8, 9, 10]);

        let control = ControlFile::parse(&data).unwrap();
        assert_eq!(control.seq_matches, 2);
        assert_eq!(control.blocks[0].rsum, 0x0a);
        assert_eq!(control.blocks[1].rsum, 0xabcd);
        assert_eq!(control.blocks[1].checksum, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let data = b"zsync: 0.6.2\nBlocksize: 2048\nLength: 3000\nHash-Lengths: 1,4,16\n\n\x00\x01".to_vec();
        assert!(ControlFile::parse(&data).is_err());
        assert!(ControlFile::parse(b"zsync: 0.6.2\nBlocksize: 1000\nLength: 1\n\n").is_err());
    }
}
