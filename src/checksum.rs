//! Adler32-style checksum over two accumulators.
//!
//! `a` is the running byte sum (seeded with 1) and `b` the running sum of `a`,
//! both mod 65521, combined as `(b << 16) | a`. Input is folded in blocks of
//! `NMAX` bytes, the largest count for which neither accumulator can overflow a
//! `u32` before reduction, so a file can be checksummed as a stream.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

pub const MOD_ADLER: u32 = 65521;
const NMAX: usize = 5552;
const STREAM_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    a: u32,
    b: u32,
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum {
    pub fn new() -> Self {
        Self { a: 1, b: 0 }
    }

    /// Feed more bytes. Splitting the input differently never changes the result.
    pub fn update(&mut self, data: &[u8]) {
        for block in data.chunks(NMAX) {
            for &byte in block {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= MOD_ADLER;
            self.b %= MOD_ADLER;
        }
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// Checksum of a complete buffer.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum = Checksum::new();
    sum.update(data);
    sum.digest()
}

pub fn verify(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}

/// Stream a reader through the checksum without buffering it whole.
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<u32> {
    let mut sum = Checksum::new();
    let mut buf = vec![0u8; STREAM_BUFFER];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sum.update(&buf[..n]);
    }
    Ok(sum.digest())
}

pub fn checksum_file(path: &Path) -> io::Result<u32> {
    let file = File::open(path)?;
    checksum_reader(BufReader::with_capacity(STREAM_BUFFER, file))
}

/// Sliding-window form of the same checksum, used for block matching.
///
/// Supports O(1) window updates: remove the oldest byte, add a new one.
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window_size: u32,
}

impl Default for RollingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window_size: 0,
        }
    }

    /// Compute the checksum over an initial window.
    pub fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u32;
        let mut sum = Checksum::new();
        sum.update(data);
        self.a = sum.a;
        self.b = sum.b;
    }

    /// Slide the window: remove `old_byte` from front, add `new_byte` at back.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let m = MOD_ADLER as u64;
        let old = old_byte as u64;
        let new = new_byte as u64;

        let a = (self.a as u64 + m - old + new) % m;
        let b = (self.b as u64 + m - 1 + a + m - (old * self.window_size as u64) % m) % m;
        self.a = a as u32;
        self.b = b as u32;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
