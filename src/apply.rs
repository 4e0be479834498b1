use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use crate::checksum;
use crate::delta;
use crate::error::UpdateError;

/// Installed file contents, memory-mapped when non-empty.
enum SourceBytes {
    Empty,
    Mapped(Mmap),
}

impl SourceBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            SourceBytes::Empty => &[],
            SourceBytes::Mapped(map) => &map[..],
        }
    }
}

fn map_source(path: &Path) -> Result<SourceBytes, UpdateError> {
    let file = File::open(path).map_err(|e| UpdateError::io("failed to open", path, e))?;
    let len = file
        .metadata()
        .map_err(|e| UpdateError::io("failed to stat", path, e))?
        .len();
    if len == 0 {
        return Ok(SourceBytes::Empty);
    }
    // SAFETY: the mapping is read-only and dropped before the caller replaces the
    // file; the update run is the only writer of the target tree.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| UpdateError::io("failed to map", path, e))?;
    Ok(SourceBytes::Mapped(map))
}

/// Turn one installed file plus one delta into the new file contents.
///
/// `source` is `None` when the file does not exist yet; the delta is then
/// decoded against an empty buffer. The source checksum is checked before the
/// decoder runs and the result is checked before it is returned, so the
/// caller only ever sees verified bytes.
pub fn apply_delta(
    source: Option<&Path>,
    delta: &[u8],
    expected_source: u32,
    expected_target: u32,
) -> Result<Vec<u8>, UpdateError> {
    let label = source
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<new file>".to_string());

    let bytes = match source {
        Some(path) => map_source(path)?,
        None => SourceBytes::Empty,
    };
    apply_delta_to(&label, bytes.as_slice(), delta, expected_source, expected_target)
}

/// Same as [`apply_delta`] over a source already in memory.
pub fn apply_delta_to(
    label: &str,
    source: &[u8],
    delta: &[u8],
    expected_source: u32,
    expected_target: u32,
) -> Result<Vec<u8>, UpdateError> {
    let actual = checksum::checksum(source);
    if actual != expected_source {
        return Err(UpdateError::SourceMismatch {
            path: label.to_string(),
            expected: expected_source,
            actual,
        });
    }

    let target = delta::decode(source, delta)?;

    let actual = checksum::checksum(&target);
    if actual != expected_target {
        return Err(UpdateError::TargetMismatch {
            path: label.to_string(),
            expected: expected_target,
            actual,
        });
    }

    debug!(
        file = label,
        source_len = source.len(),
        delta_len = delta.len(),
        target_len = target.len(),
        "delta applied"
    );
    Ok(target)
}
