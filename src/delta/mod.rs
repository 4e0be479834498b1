//! Versioned binary delta format: decoder, encoder and wire layout.

pub mod decode;
pub mod encode;
pub mod format;

pub use decode::decode;
pub use encode::{encode, DiffOptions};
pub use format::{Instruction, PatchWindow, FORMAT_VERSION, MAGIC};
