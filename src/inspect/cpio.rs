// src/inspect/cpio.rs

//! Reader for cpio (newc) archives, the container of older opsi packages

use std::io::{self, Read};

/// newc header size
const HEADER_SIZE: usize = 110;
const MAGIC_NEWC: &[u8] = b"070701";
const MAGIC_CRC: &[u8] = b"070702";
const TRAILER: &str = "TRAILER!!!";

/// Largest member read into memory
const MAX_MEMBER_SIZE: u64 = 512 * 1024 * 1024;

/// Whether `data` starts with a newc header
pub fn is_cpio(data: &[u8]) -> bool {
    data.starts_with(MAGIC_NEWC) || data.starts_with(MAGIC_CRC)
}

pub struct CpioReader<R: Read> {
    reader: R,
}

impl<R: Read> CpioReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    fn skip_padding(&mut self, consumed: usize) -> io::Result<()> {
        let pad = (4 - consumed % 4) % 4;
        let mut skip = [0u8; 3];
        self.reader.read_exact(&mut skip[..pad])
    }

    /// Next member name and content; `None` at the trailer
    pub fn next_member(&mut self) -> io::Result<Option<(String, Vec<u8>)>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        if !is_cpio(&header) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid cpio magic {:?}", String::from_utf8_lossy(&header[..6])),
            ));
        }

        let field = |start: usize| -> io::Result<u64> {
            let text = std::str::from_utf8(&header[start..start + 8])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            u64::from_str_radix(text, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };
        let size = field(54)?;
        let name_size = field(94)? as usize;
        if size > MAX_MEMBER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cpio member of {size} bytes too large"),
            ));
        }

        let mut name = vec![0u8; name_size];
        self.reader.read_exact(&mut name)?;
        self.skip_padding(HEADER_SIZE + name_size)?;
        if name.last() == Some(&0) {
            name.pop();
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        if name == TRAILER {
            return Ok(None);
        }

        let mut content = vec![0u8; size as usize];
        self.reader.read_exact(&mut content)?;
        self.skip_padding(size as usize)?;

        Ok(Some((name, content)))
    }
}

#[cfg(test)]
pub(crate) fn build_newc(members: &[(&str, &[u8])]) -> Vec<u8> {
    fn pad(out: &mut Vec<u8>) {
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    let mut out = Vec::new();
    let trailer: (&str, &[u8]) = (TRAILER, b"");
    for (name, content) in members.iter().chain(std::iter::once(&trailer)) {
        out.extend_from_slice(MAGIC_NEWC);
        let fields = [0, 0o100644, 0, 0, 1, 0, content.len(), 0, 0, 0, 0, name.len() + 1, 0];
        for value in fields {
            out.extend_from_slice(format!("{value:08X}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        pad(&mut out);
        out.extend_from_slice(content);
        pad(&mut out);
    }
    out
}
