// src/zsync/rsum.rs

//! Rolling checksum
//!
//! The weak checksum of zsync: `a` is the sum of the block bytes, `b` the
//! sum of the running values of `a`. Both wrap at 16 bits. Sliding the
//! window by one byte is O(1).

/// Weak rolling checksum of one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rsum {
    pub a: u16,
    pub b: u16,
}

impl Rsum {
    /// Checksum of a whole block
    pub fn compute(block: &[u8]) -> Self {
        let mut a: u16 = 0;
        let mut b: u16 = 0;
        for &c in block {
            a = a.wrapping_add(c as u16);
            b = b.wrapping_add(a);
        }
        Self { a, b }
    }

    /// Slide the window of `blocksize` bytes by one byte
    pub fn roll(&mut self, out: u8, incoming: u8, blocksize: usize) {
        self.a = self.a.wrapping_sub(out as u16).wrapping_add(incoming as u16);
        self.b = self
            .b
            .wrapping_sub((blocksize as u16).wrapping_mul(out as u16))
            .wrapping_add(self.a);
    }

    /// Big-endian `a` followed by big-endian `b`
    pub fn to_bytes(self) -> [u8; 4] {
        let [a0, a1] = self.a.to_be_bytes();
        let [b0, b1] = self.b.to_be_bytes();
        [a0, a1, b0, b1]
    }

    /// Lookup key restricted to the trailing `rsum_bytes` bytes
    pub fn key(self, rsum_bytes: usize) -> u32 {
        key_from_bytes(&self.to_bytes()[4 - rsum_bytes.clamp(1, 4)..])
    }
}

/// Lookup key of truncated checksum bytes as stored in a control file
pub fn key_from_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}
