//! Delta stream layout, version 1.
//!
//! ```text
//! "UDLT" | version:u8 | target_len:varint | window_count:varint | window*
//! window = window_len:varint | instruction_count:varint | instruction*
//! ```
//!
//! Copy-from-target offsets are absolute positions in the output produced so
//! far and must point strictly before its current end. A copy may run past the
//! end it started from; bytes are then copied one at a time, forward.

use crate::error::DeltaError;

pub const MAGIC: &[u8; 4] = b"UDLT";
pub const FORMAT_VERSION: u8 = 1;

pub const OP_ADD: u8 = 0x00;
pub const OP_RUN: u8 = 0x01;
pub const OP_COPY_SOURCE_ABS: u8 = 0x02;
pub const OP_COPY_SOURCE_REL: u8 = 0x03;
pub const OP_COPY_TARGET: u8 = 0x04;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Add(Vec<u8>),
    Run { byte: u8, length: u64 },
    CopySource { offset: u64, length: u64 },
    CopyTarget { offset: u64, length: u64 },
}

impl Instruction {
    pub fn output_len(&self) -> u64 {
        match self {
            Instruction::Add(data) => data.len() as u64,
            Instruction::Run { length, .. }
            | Instruction::CopySource { length, .. }
            | Instruction::CopyTarget { length, .. } => *length,
        }
    }
}

/// The encoder's grouping of instructions into one window and the number of
/// bytes it produces. The decoder reads windows straight off the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchWindow {
    pub target_len: u64,
    pub instructions: Vec<Instruction>,
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Bounds-checked cursor over a delta stream.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, DeltaError> {
        let byte = *self.data.get(self.pos).ok_or(DeltaError::Truncated {
            offset: self.pos,
            field,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DeltaError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DeltaError::Truncated {
                offset: self.data.len(),
                field,
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_varint(&mut self, field: &'static str) -> Result<u64, DeltaError> {
        let start = self.pos;
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8(field)?;
            let bits = (byte & 0x7F) as u64;
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(DeltaError::format(format!(
                    "{field} at byte {start} overflows 64 bits"
                )));
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DeltaError::format(format!(
            "{field} at byte {start} is longer than {MAX_VARINT_LEN} bytes"
        )))
    }
}
