use std::collections::HashMap;

use crate::checksum::RollingChecksum;
use crate::delta::format::{
    varint_len, write_varint, zigzag_encode, Instruction, PatchWindow, FORMAT_VERSION, MAGIC,
    OP_ADD, OP_COPY_SOURCE_ABS, OP_COPY_SOURCE_REL, OP_COPY_TARGET, OP_RUN,
};

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_WINDOW_SIZE: u64 = 1 << 20;
const MIN_BLOCK_SIZE: usize = 4;
const MIN_RUN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Granularity of block matching against source and earlier target.
    pub block_size: usize,
    /// Output bytes per window before a new window is started.
    pub window_size: u64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Compute a version 1 delta that turns `source` into `target`.
pub fn encode(source: &[u8], target: &[u8], options: DiffOptions) -> Vec<u8> {
    let instructions = compute_instructions(source, target, options.block_size);
    let windows = split_windows(instructions, options.window_size);
    serialize(target.len() as u64, &windows)
}

struct BlockIndex {
    table: HashMap<u32, Vec<(u64, blake3::Hash)>>,
}

impl BlockIndex {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Index every full block of `data`. A trailing partial block can never
    /// match a full rolling window, so it is left out.
    fn build(data: &[u8], block_size: usize) -> Self {
        let mut index = Self::new();
        for (i, block) in data.chunks_exact(block_size).enumerate() {
            index.insert(block, (i * block_size) as u64);
        }
        index
    }

    fn insert(&mut self, block: &[u8], offset: u64) {
        let mut rolling = RollingChecksum::new();
        rolling.init(block);
        self.table
            .entry(rolling.digest())
            .or_default()
            .push((offset, blake3::hash(block)));
    }

    fn find(&self, digest: u32, window: &[u8]) -> Option<u64> {
        let candidates = self.table.get(&digest)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .find(|(_, hash)| *hash == strong)
            .map(|(offset, _)| *offset)
    }
}

/// Collects instructions, buffering literal bytes into a single ADD.
struct Emitter {
    instructions: Vec<Instruction>,
    literal: Vec<u8>,
}

impl Emitter {
    fn flush_literal(&mut self) {
        if !self.literal.is_empty() {
            self.instructions
                .push(Instruction::Add(std::mem::take(&mut self.literal)));
        }
    }

    fn push(&mut self, instruction: Instruction) {
        self.flush_literal();
        if let (
            Some(Instruction::CopySource { offset, length }),
            Instruction::CopySource {
                offset: next,
                length: more,
            },
        ) = (self.instructions.last_mut(), &instruction)
        {
            if *offset + *length == *next {
                *length += *more;
                return;
            }
        }
        self.instructions.push(instruction);
    }

    fn finish(mut self) -> Vec<Instruction> {
        self.flush_literal();
        self.instructions
    }
}

/// Block-matching diff (rsync-like):
/// 1. Index source blocks by rolling checksum, confirmed with BLAKE3
/// 2. Scan the target with a rolling window, also indexing target blocks
///    already passed so repeated content becomes a back-reference
/// 3. Extend each match forward byte by byte
/// 4. Runs of one byte become RUN, everything else is buffered as ADD
pub fn compute_instructions(old: &[u8], new: &[u8], block_size: usize) -> Vec<Instruction> {
    let block = block_size.max(MIN_BLOCK_SIZE);
    let source_index = BlockIndex::build(old, block);
    let mut target_index = BlockIndex::new();
    let mut indexed_upto = 0usize;

    let mut emitter = Emitter {
        instructions: Vec::new(),
        literal: Vec::new(),
    };
    let mut rolling: Option<RollingChecksum> = None;
    let mut pos = 0usize;

    while pos < new.len() {
        while indexed_upto + block <= pos {
            target_index.insert(&new[indexed_upto..indexed_upto + block], indexed_upto as u64);
            indexed_upto += block;
        }

        let run = run_length(&new[pos..]);
        if run >= MIN_RUN {
            emitter.push(Instruction::Run {
                byte: new[pos],
                length: run as u64,
            });
            pos += run;
            rolling = None;
            continue;
        }

        if pos + block <= new.len() {
            let window = &new[pos..pos + block];
            let digest = rolling
                .get_or_insert_with(|| {
                    let mut r = RollingChecksum::new();
                    r.init(window);
                    r
                })
                .digest();

            if let Some(offset) = source_index.find(digest, window) {
                let length = extend_match(old, offset as usize, new, pos, block);
                emitter.push(Instruction::CopySource {
                    offset,
                    length: length as u64,
                });
                pos += length;
                rolling = None;
                continue;
            }

            if let Some(offset) = target_index.find(digest, window) {
                let length = extend_match(new, offset as usize, new, pos, block);
                emitter.push(Instruction::CopyTarget {
                    offset,
                    length: length as u64,
                });
                pos += length;
                rolling = None;
                continue;
            }
        }

        emitter.literal.push(new[pos]);
        pos += 1;
        if pos + block <= new.len() {
            if let Some(r) = rolling.as_mut() {
                r.rotate(new[pos - 1], new[pos + block - 1]);
            }
        } else {
            rolling = None;
        }
    }

    emitter.finish()
}

fn run_length(data: &[u8]) -> usize {
    match data.first() {
        Some(&first) => data.iter().take_while(|&&b| b == first).count(),
        None => 0,
    }
}

/// Grow a confirmed `matched`-byte match as far as both sides agree.
fn extend_match(base: &[u8], base_pos: usize, new: &[u8], pos: usize, matched: usize) -> usize {
    let mut len = matched;
    while pos + len < new.len() && base_pos + len < base.len() && base[base_pos + len] == new[pos + len]
    {
        len += 1;
    }
    len
}

/// Group instructions into windows of roughly `window_size` output bytes.
pub fn split_windows(instructions: Vec<Instruction>, window_size: u64) -> Vec<PatchWindow> {
    let mut windows = Vec::new();
    let mut current = PatchWindow::default();
    for instruction in instructions {
        current.target_len += instruction.output_len();
        current.instructions.push(instruction);
        if current.target_len >= window_size {
            windows.push(std::mem::take(&mut current));
        }
    }
    if !current.instructions.is_empty() {
        windows.push(current);
    }
    windows
}

pub fn serialize(target_len: u64, windows: &[PatchWindow]) -> Vec<u8> {
    let mut out = MAGIC.to_vec();
    out.push(FORMAT_VERSION);
    write_varint(&mut out, target_len);
    write_varint(&mut out, windows.len() as u64);

    let mut last_source_end = 0u64;
    for window in windows {
        write_varint(&mut out, window.target_len);
        write_varint(&mut out, window.instructions.len() as u64);
        for instruction in &window.instructions {
            match instruction {
                Instruction::Add(data) => {
                    out.push(OP_ADD);
                    write_varint(&mut out, data.len() as u64);
                    out.extend_from_slice(data);
                }
                Instruction::Run { byte, length } => {
                    out.push(OP_RUN);
                    write_varint(&mut out, *length);
                    out.push(*byte);
                }
                Instruction::CopySource { offset, length } => {
                    let relative = zigzag_encode(*offset as i64 - last_source_end as i64);
                    if varint_len(relative) < varint_len(*offset) {
                        out.push(OP_COPY_SOURCE_REL);
                        write_varint(&mut out, relative);
                    } else {
                        out.push(OP_COPY_SOURCE_ABS);
                        write_varint(&mut out, *offset);
                    }
                    write_varint(&mut out, *length);
                    last_source_end = offset + length;
                }
                Instruction::CopyTarget { offset, length } => {
                    out.push(OP_COPY_TARGET);
                    write_varint(&mut out, *offset);
                    write_varint(&mut out, *length);
                }
            }
        }
    }
    out
}
