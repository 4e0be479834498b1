use crate::delta::format::{
    zigzag_decode, Reader, FORMAT_VERSION, MAGIC, OP_ADD, OP_COPY_SOURCE_ABS, OP_COPY_SOURCE_REL,
    OP_COPY_TARGET, OP_RUN,
};
use crate::error::DeltaError;

/// Upper bound on the up-front allocation trusted from a delta header.
const PREALLOC_LIMIT: usize = 64 * 1024 * 1024;

/// Reconstruct the target from `source` and a version 1 delta stream.
///
/// Every instruction is bounds-checked against the source and against the
/// output produced so far; nothing is clamped.
pub fn decode(source: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut reader = Reader::new(delta);
    read_header(&mut reader)?;

    let target_len = reader.read_varint("target length")?;
    let target_len = usize::try_from(target_len).map_err(|_| {
        DeltaError::format(format!("target length {target_len} does not fit in memory"))
    })?;
    let window_count = reader.read_varint("window count")?;

    let mut state = DecodeState {
        source,
        out: Vec::with_capacity(target_len.min(PREALLOC_LIMIT)),
        target_len,
        last_source_end: 0,
    };

    for window in 0..window_count {
        state.decode_window(&mut reader, window)?;
    }

    if !reader.is_empty() {
        return Err(DeltaError::format(format!(
            "{} trailing bytes after the last window",
            delta.len() - reader.position()
        )));
    }
    if state.out.len() != target_len {
        return Err(DeltaError::format(format!(
            "produced {} bytes, header declares {target_len}",
            state.out.len()
        )));
    }

    Ok(state.out)
}

fn read_header(reader: &mut Reader<'_>) -> Result<(), DeltaError> {
    let magic = reader.read_bytes(MAGIC.len(), "magic")?;
    if magic != MAGIC {
        return Err(DeltaError::format("missing delta magic"));
    }
    let version = reader.read_u8("version")?;
    if version != FORMAT_VERSION {
        return Err(DeltaError::format(format!(
            "unsupported delta version {version} (expected {FORMAT_VERSION})"
        )));
    }
    Ok(())
}

struct DecodeState<'s> {
    source: &'s [u8],
    out: Vec<u8>,
    target_len: usize,
    last_source_end: u64,
}

impl DecodeState<'_> {
    fn decode_window(&mut self, reader: &mut Reader<'_>, window: u64) -> Result<(), DeltaError> {
        let window_len = reader.read_varint("window length")?;
        let count = reader.read_varint("instruction count")?;
        let window_start = self.out.len();

        for _ in 0..count {
            let opcode = reader.read_u8("opcode")?;
            match opcode {
                OP_ADD => {
                    let len = self.read_len(reader)?;
                    let data = reader.read_bytes(len, "literal data")?;
                    self.out.extend_from_slice(data);
                }
                OP_RUN => {
                    let len = self.read_len(reader)?;
                    let byte = reader.read_u8("run byte")?;
                    self.reserve(len)?;
                    self.out.resize(self.out.len() + len, byte);
                }
                OP_COPY_SOURCE_ABS | OP_COPY_SOURCE_REL => {
                    let offset = if opcode == OP_COPY_SOURCE_ABS {
                        reader.read_varint("source offset")?
                    } else {
                        let delta = zigzag_decode(reader.read_varint("source offset")?);
                        (self.last_source_end as i128 + delta as i128)
                            .try_into()
                            .map_err(|_| DeltaError::format("relative source offset out of range"))?
                    };
                    let len = self.read_len(reader)?;
                    self.copy_source(offset, len)?;
                }
                OP_COPY_TARGET => {
                    let offset = reader.read_varint("target offset")?;
                    let len = self.read_len(reader)?;
                    self.copy_target(offset, len)?;
                }
                other => {
                    return Err(DeltaError::format(format!(
                        "unknown opcode {other:#04x} at byte {}",
                        reader.position() - 1
                    )));
                }
            }
        }

        let produced = (self.out.len() - window_start) as u64;
        if produced != window_len {
            return Err(DeltaError::format(format!(
                "window {window} produced {produced} bytes, declared {window_len}"
            )));
        }
        Ok(())
    }

    /// Read an instruction length and make sure it fits in the declared target.
    fn read_len(&self, reader: &mut Reader<'_>) -> Result<usize, DeltaError> {
        let len = reader.read_varint("instruction length")?;
        if len == 0 {
            return Err(DeltaError::format("zero-length instruction"));
        }
        let room = (self.target_len - self.out.len()) as u64;
        if len > room {
            return Err(DeltaError::format(format!(
                "instruction of {len} bytes overruns declared target length {}",
                self.target_len
            )));
        }
        Ok(len as usize)
    }

    /// The header's target length is untrusted; a failed allocation must
    /// surface as an error, not abort.
    fn reserve(&mut self, len: usize) -> Result<(), DeltaError> {
        self.out.try_reserve(len).map_err(|e| {
            DeltaError::format(format!("cannot allocate {len} output bytes: {e}"))
        })
    }

    fn copy_source(&mut self, offset: u64, len: usize) -> Result<(), DeltaError> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.source.len() as u64)
            .ok_or_else(|| {
                DeltaError::format(format!(
                    "source copy {offset}+{len} exceeds source length {}",
                    self.source.len()
                ))
            })?;
        self.out
            .extend_from_slice(&self.source[offset as usize..end as usize]);
        self.last_source_end = end;
        Ok(())
    }

    fn copy_target(&mut self, offset: u64, len: usize) -> Result<(), DeltaError> {
        let produced = self.out.len();
        if offset >= produced as u64 {
            return Err(DeltaError::format(format!(
                "target copy from {offset} but only {produced} bytes produced"
            )));
        }
        self.reserve(len)?;
        let start = offset as usize;
        if start + len <= produced {
            self.out.extend_from_within(start..start + len);
        } else {
            // Overlapping forward copy: later bytes read what this copy just wrote.
            for i in start..start + len {
                let byte = self.out[i];
                self.out.push(byte);
            }
        }
        Ok(())
    }
}
