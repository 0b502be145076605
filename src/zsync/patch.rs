// src/zsync/patch.rs

//! Patch planning
//!
//! Scans local source files with the rolling checksum and decides, block
//! by block, whether the target content can be copied from a local file
//! or has to be fetched from the server.

use super::control::ControlFile;
use super::rsum::Rsum;
use crate::error::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Bytes scanned before the scan rate is judged
pub const DEFAULT_MIN_SAMPLE_BYTES: u64 = 5 * 1000 * 1000;

/// Scan rate (bytes/s) below which local scanning is abandoned
pub const DEFAULT_MIN_SCAN_RATE: f64 = 1_000_000.0;

/// Read granularity while scanning sources
const SCAN_CHUNK: usize = 1024 * 1024;

/// One step of rebuilding the target file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Copy `size` bytes at `source_offset` of `sources[source]`
    Local {
        source: usize,
        source_offset: u64,
        target_offset: u64,
        size: u64,
    },
    /// Fetch `size` bytes at `target_offset` from the server
    Remote { target_offset: u64, size: u64 },
}

/// Inclusive byte range of the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered, saturating at `u64::MAX`
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Ordered instructions rebuilding the target file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub sources: Vec<PathBuf>,
    pub instructions: Vec<Instruction>,
}

impl PatchPlan {
    pub fn local_bytes(&self) -> u64 {
        self.instructions
            .iter()
            .map(|i| match i {
                Instruction::Local { size, .. } => *size,
                Instruction::Remote { .. } => 0,
            })
            .sum()
    }

    pub fn remote_bytes(&self) -> u64 {
        self.remote_ranges().iter().map(ByteRange::len).sum()
    }

    /// Byte ranges to request from the server
    pub fn remote_ranges(&self) -> Vec<ByteRange> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Remote { target_offset, size } => Some(ByteRange {
                    start: *target_offset,
                    end: target_offset + size - 1,
                }),
                Instruction::Local { .. } => None,
            })
            .collect()
    }
}

/// Abandons local scanning when it runs slower than a download would
///
/// Tripping never fails the transfer; blocks not found so far are fetched
/// from the server instead.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    min_sample_bytes: u64,
    min_rate: f64,
    started: Instant,
    scanned: u64,
    tripped: bool,
}

impl CircuitBreaker {
    pub fn new(min_sample_bytes: u64, min_rate: f64) -> Self {
        Self {
            min_sample_bytes,
            min_rate,
            started: Instant::now(),
            scanned: 0,
            tripped: false,
        }
    }

    /// Record scanned bytes, returns `true` once the breaker has tripped
    pub fn record(&mut self, bytes: u64) -> bool {
        self.scanned += bytes;
        if !self.tripped && self.scanned >= self.min_sample_bytes {
            let elapsed = self.started.elapsed().as_secs_f64().max(1e-9);
            let rate = self.scanned as f64 / elapsed;
            if rate < self.min_rate {
                warn!(
                    "Local scan too slow ({:.0} bytes/s after {} bytes), fetching remaining blocks remotely",
                    rate, self.scanned
                );
                self.tripped = true;
            }
        }
        self.tripped
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLE_BYTES, DEFAULT_MIN_SCAN_RATE)
    }
}

/// Where a target block was found locally
#[derive(Debug, Clone, Copy)]
struct Found {
    source: usize,
    offset: u64,
}

/// Sliding window over a source file, zero-padded by one block at EOF
struct Window<R> {
    reader: R,
    buf: Vec<u8>,
    /// File offset of `buf[0]`
    buf_start: u64,
    file_len: u64,
    padded_len: u64,
}

impl<R: Read> Window<R> {
    fn new(reader: R, file_len: u64, blocksize: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(SCAN_CHUNK + blocksize),
            buf_start: 0,
            file_len,
            padded_len: file_len + blocksize as u64,
        }
    }

    /// Make sure `[pos, pos + len)` is buffered
    fn ensure(&mut self, pos: u64, len: usize) -> std::io::Result<()> {
        let needed_end = pos + len as u64;
        if pos > self.buf_start + SCAN_CHUNK as u64 {
            let drop = (pos - self.buf_start) as usize;
            self.buf.drain(..drop);
            self.buf_start = pos;
        }
        while self.buf_start + (self.buf.len() as u64) < needed_end {
            let have = self.buf_start + self.buf.len() as u64;
            if have >= self.file_len {
                let pad = (needed_end.min(self.padded_len) - have) as usize;
                self.buf.resize(self.buf.len() + pad, 0);
                break;
            }
            let want = SCAN_CHUNK.min((self.file_len - have) as usize);
            let old = self.buf.len();
            self.buf.resize(old + want, 0);
            self.reader.read_exact(&mut self.buf[old..])?;
        }
        Ok(())
    }

    fn slice(&self, pos: u64, len: usize) -> &[u8] {
        let start = (pos - self.buf_start) as usize;
        &self.buf[start..start + len]
    }

    fn byte(&self, pos: u64) -> u8 {
        self.buf[(pos - self.buf_start) as usize]
    }
}

/// Compute the instructions rebuilding the target described by `control`
///
/// Sources are scanned in order; a block found in an earlier source is
/// not searched again.
pub fn plan(control: &ControlFile, sources: &[PathBuf], breaker: &mut CircuitBreaker) -> Result<PatchPlan> {
    let block_count = control.block_count();
    let mut found: Vec<Option<Found>> = vec![None; block_count];

    let mut lookup: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, block) in control.blocks.iter().enumerate() {
        lookup.entry(block.rsum).or_default().push(index);
    }

    for (source_index, source) in sources.iter().enumerate() {
        if breaker.is_tripped() || found.iter().all(Option::is_some) {
            break;
        }
        match scan_source(control, source, source_index, &lookup, &mut found, breaker) {
            Ok(matched) => info!(
                "Found {} matching blocks in {}",
                matched,
                source.display()
            ),
            Err(e) => warn!("Failed to scan {}: {}", source.display(), e),
        }
    }

    let mut instructions: Vec<Instruction> = Vec::new();
    for (index, found) in found.iter().enumerate() {
        let (target_offset, size) = control.block_span(index);
        let next = match found {
            Some(f) => Instruction::Local {
                source: f.source,
                source_offset: f.offset,
                target_offset,
                size,
            },
            None => Instruction::Remote { target_offset, size },
        };
        push_merged(&mut instructions, next);
    }

    let plan = PatchPlan {
        sources: sources.to_vec(),
        instructions,
    };
    debug!(
        "Patch plan: {} bytes local, {} bytes remote",
        plan.local_bytes(),
        plan.remote_bytes()
    );
    Ok(plan)
}

/// Append an instruction, extending the previous one when contiguous
fn push_merged(instructions: &mut Vec<Instruction>, next: Instruction) {
    if let Some(last) = instructions.last_mut() {
        if extend(last, &next) {
            return;
        }
    }
    instructions.push(next);
}

fn extend(last: &mut Instruction, next: &Instruction) -> bool {
    match (last, next) {
        (
            Instruction::Remote { target_offset, size },
            Instruction::Remote { target_offset: next_offset, size: next_size },
        ) if *target_offset + *size == *next_offset => {
            *size += *next_size;
            true
        }
        (
            Instruction::Local {
                source,
                source_offset,
                target_offset,
                size,
            },
            Instruction::Local {
                source: next_source,
                source_offset: next_source_offset,
                target_offset: next_target_offset,
                size: next_size,
            },
        ) if *source == *next_source
            && *source_offset + *size == *next_source_offset
            && *target_offset + *size == *next_target_offset =>
        {
            *size += *next_size;
            true
        }
        _ => false,
    }
}

fn scan_source(
    control: &ControlFile,
    path: &Path,
    source_index: usize,
    lookup: &HashMap<u32, Vec<usize>>,
    found: &mut [Option<Found>],
    breaker: &mut CircuitBreaker,
) -> std::io::Result<usize> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let blocksize = control.blocksize;
    let mut window = Window::new(BufReader::new(file), file_len, blocksize);

    if file_len == 0 {
        return Ok(0);
    }

    let mut matched = 0;
    let mut pos: u64 = 0;
    let mut since_check: u64 = 0;
    window.ensure(pos, blocksize)?;
    let mut rsum = Rsum::compute(window.slice(pos, blocksize));

    // Windows starting at or beyond EOF contain only padding
    while pos < file_len {
        if let Some(candidates) = lookup.get(&rsum.key(control.rsum_bytes)) {
            let strong = control.strong_checksum(window.slice(pos, blocksize));
            let mut hit = false;
            for &index in candidates {
                if control.blocks[index].checksum != strong {
                    continue;
                }
                let (_, size) = control.block_span(index);
                // Only bytes actually present in the source can be copied
                if pos + size > file_len {
                    continue;
                }
                hit = true;
                if found[index].is_none() {
                    found[index] = Some(Found {
                        source: source_index,
                        offset: pos,
                    });
                    matched += 1;
                }
            }

            if hit {
                pos += blocksize as u64;
                since_check += blocksize as u64;
                if pos >= file_len {
                    break;
                }
                window.ensure(pos, blocksize)?;
                rsum = Rsum::compute(window.slice(pos, blocksize));
                continue;
            }
        }

        window.ensure(pos, blocksize + 1)?;
        if pos + blocksize as u64 >= window.padded_len {
            break;
        }
        rsum.roll(window.byte(pos), window.byte(pos + blocksize as u64), blocksize);
        pos += 1;
        since_check += 1;

        if since_check >= SCAN_CHUNK as u64 {
            if breaker.record(since_check) {
                return Ok(matched);
            }
            since_check = 0;
        }
    }

    breaker.record(since_check);
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_window_pads_with_zeros() {
        let mut window = Window::new(Cursor::new(vec![1u8, 2, 3]), 3, 4);
        window.ensure(0, 4).unwrap();
        assert_eq!(window.slice(0, 4), &[1, 2, 3, 0]);
        window.ensure(2, 5).unwrap();
        assert_eq!(window.slice(2, 5), &[3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_plan_finds_shifted_blocks() {
        let dir = tempdir().unwrap();
        let target_data = pseudo_random(4 * 2048 + 100, 7);
        let target = dir.path().join("new.opsi");
        fs::write(&target, &target_data).unwrap();
        let control = ControlFile::generate(&target, None).unwrap();

        // Old file: garbage prefix, blocks 1 and 2, then the tail block
        let mut old = pseudo_random(333, 99);
        old.extend_from_slice(&target_data[2048..3 * 2048]);
        old.extend_from_slice(&target_data[4 * 2048..]);
        let source = dir.path().join("old.opsi");
        fs::write(&source, &old).unwrap();

        let plan = plan(&control, &[source], &mut CircuitBreaker::default()).unwrap();
        assert_eq!(
            plan.instructions,
            vec![
                Instruction::Remote { target_offset: 0, size: 2048 },
                Instruction::Local {
                    source: 0,
                    source_offset: 333,
                    target_offset: 2048,
                    size: 4096
                },
                Instruction::Remote { target_offset: 3 * 2048, size: 2048 },
                Instruction::Local {
                    source: 0,
                    source_offset: 333 + 4096,
                    target_offset: 4 * 2048,
                    size: 100
                },
            ]
        );
        assert_eq!(plan.local_bytes(), 4196);
        assert_eq!(
            plan.remote_ranges(),
            vec![
                ByteRange { start: 0, end: 2047 },
                ByteRange { start: 6144, end: 8191 }
            ]
        );
    }

    #[test]
    fn test_tripped_breaker_fetches_everything() {
        let dir = tempdir().unwrap();
        let data = pseudo_random(3 * 2048, 3);
        let target = dir.path().join("t.opsi");
        fs::write(&target, &data).unwrap();
        let control = ControlFile::generate(&target, None).unwrap();

        // A rate no scan can reach trips immediately after the sample
        let mut breaker = CircuitBreaker::new(0, f64::MAX);
        breaker.record(1);
        assert!(breaker.is_tripped());

        let plan = plan(&control, &[target], &mut breaker).unwrap();
        assert_eq!(
            plan.instructions,
            vec![Instruction::Remote { target_offset: 0, size: 3 * 2048 }]
        );
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("t.opsi");
        fs::write(&target, pseudo_random(1000, 1)).unwrap();
        let control = ControlFile::generate(&target, None).unwrap();

        let plan = plan(&control, &[dir.path().join("missing.opsi")], &mut CircuitBreaker::default()).unwrap();
        assert_eq!(plan.remote_bytes(), 1000);
    }
}
