// src/inspect/mod.rs

//! Package inspection
//!
//! An `.opsi` file is a tar or cpio container holding `OPSI.tar.gz` (or
//! `.zstd`, or plain `.tar`), which in turn holds the `control` or
//! `control.toml` file. Only the control data is read; nothing is
//! extracted to disk.

mod control;
mod cpio;

pub use control::{parse_control, parse_control_toml, PackageControl};

use crate::error::{Error, Result};
use cpio::{is_cpio, CpioReader};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tar::Archive;
use tracing::debug;

/// Offset and value of the POSIX tar magic
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Reads package metadata needed to order installations
pub trait PackageInspector: Send + Sync {
    /// Product ids the package depends on
    fn dependencies(&self, package: &Path) -> Result<Vec<String>>;
}

/// Inspector for `.opsi` package files
#[derive(Debug, Default)]
pub struct OpsiPackageInspector;

impl PackageInspector for OpsiPackageInspector {
    fn dependencies(&self, package: &Path) -> Result<Vec<String>> {
        Ok(read_package_control(package)?.dependencies)
    }
}

fn inspect_error(package: &Path, message: impl std::fmt::Display) -> Error {
    Error::ParseError(format!("Failed to inspect {}: {}", package.display(), message))
}

/// Read the control data of an `.opsi` file
pub fn read_package_control(package: &Path) -> Result<PackageControl> {
    let mut file = BufReader::new(
        File::open(package).map_err(|e| inspect_error(package, e))?,
    );
    let mut head = vec![0u8; TAR_MAGIC_OFFSET + TAR_MAGIC.len()];
    let read = read_prefix(&mut file, &mut head).map_err(|e| inspect_error(package, e))?;
    head.truncate(read);
    let chained = head.as_slice().chain(file);

    let found = if is_cpio(&head) {
        find_cpio_member(chained)
    } else if head.get(TAR_MAGIC_OFFSET..).is_some_and(|m| m.starts_with(TAR_MAGIC)) {
        find_tar_member(chained)
    } else {
        return Err(inspect_error(package, "unknown container format"));
    };
    let opsi_member = found.map_err(|e| inspect_error(package, e))?;

    let (name, data) = opsi_member.ok_or_else(|| inspect_error(package, "no OPSI archive found"))?;
    debug!("Reading control data from {} in {}", name, package.display());
    control_from_opsi_archive(&name, &data).map_err(|e| inspect_error(package, e))
}

fn read_prefix(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn is_opsi_archive(name: &str) -> bool {
    let name = name.trim_start_matches("./");
    name.starts_with("OPSI.tar")
}

fn find_cpio_member(reader: impl Read) -> std::io::Result<Option<(String, Vec<u8>)>> {
    let mut cpio = CpioReader::new(reader);
    while let Some((name, content)) = cpio.next_member()? {
        if is_opsi_archive(&name) {
            return Ok(Some((name, content)));
        }
    }
    Ok(None)
}

fn find_tar_member(reader: impl Read) -> std::io::Result<Option<(String, Vec<u8>)>> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if is_opsi_archive(&name) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(Some((name, content)));
        }
    }
    Ok(None)
}

/// Find `control.toml` or `control` in the inner OPSI archive
fn control_from_opsi_archive(name: &str, data: &[u8]) -> Result<PackageControl> {
    let reader: Box<dyn Read + '_> = if name.ends_with(".gz") {
        Box::new(GzDecoder::new(data))
    } else if name.ends_with(".zstd") || name.ends_with(".zst") {
        Box::new(zstd::Decoder::new(data)?)
    } else if name.ends_with(".tar") {
        Box::new(data)
    } else {
        return Err(Error::ParseError(format!("unsupported compression of {name}")));
    };

    let mut legacy: Option<String> = None;
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
        match file_name.as_str() {
            "control.toml" => {
                let mut text = String::new();
                entry.read_to_string(&mut text)?;
                return parse_control_toml(&text);
            }
            "control" => {
                let mut text = String::new();
                entry.read_to_string(&mut text)?;
                legacy = Some(text);
            }
            _ => {}
        }
    }

    match legacy {
        Some(text) => parse_control(&text),
        None => Err(Error::ParseError(format!("no control file in {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use tempfile::tempdir;

    fn tar_of(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in members {
            let mut header = tar::Header::new_ustar();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, data).unwrap();
        encoder.finish().unwrap()
    }

    const CONTROL: &[u8] = b"[Package]\nversion: 1\ndepends: opsi-script\n\n[Product]\nid: swaudit\nversion: 4.2\n";

    #[test]
    fn test_tar_package_with_gzip_control() {
        let inner = gzip(&tar_of(&[("OPSI/control", CONTROL)]));
        let outer = tar_of(&[("OPSI.tar.gz", inner.as_slice()), ("CLIENT_DATA.tar.gz", &b""[..])]);

        let dir = tempdir().unwrap();
        let package = dir.path().join("swaudit_4.2-1.opsi");
        fs::write(&package, outer).unwrap();

        let control = read_package_control(&package).unwrap();
        assert_eq!(control.product_id, "swaudit");
        assert_eq!(
            OpsiPackageInspector.dependencies(&package).unwrap(),
            vec!["opsi-script".to_string()]
        );
    }

    #[test]
    fn test_cpio_package_prefers_control_toml() {
        let toml = b"[Package]\nversion = \"1\"\ndepends = [\"hwaudit\"]\n\n[Product]\nid = \"swaudit\"\nversion = \"4.2\"\n";
        let inner = tar_of(&[("control", CONTROL), ("control.toml", &toml[..])]);
        let outer = cpio::build_newc(&[("OPSI.tar", inner.as_slice())]);

        let dir = tempdir().unwrap();
        let package = dir.path().join("swaudit_4.2-1.opsi");
        fs::write(&package, outer).unwrap();

        assert_eq!(
            OpsiPackageInspector.dependencies(&package).unwrap(),
            vec!["hwaudit".to_string()]
        );
    }

    #[test]
    fn test_unknown_container() {
        let dir = tempdir().unwrap();
        let package = dir.path().join("broken_1.0-1.opsi");
        fs::write(&package, b"garbage").unwrap();
        assert!(read_package_control(&package).is_err());
    }
}
