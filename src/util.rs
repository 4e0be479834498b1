use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::BACKUP_DIR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

/// Walk an installation tree, keyed by relative path with forward slashes.
///
/// A top-level backup directory left by an update run is not part of the
/// installation and is skipped.
pub fn scan_tree(root: &Path) -> Result<BTreeMap<String, TreeEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = BTreeMap::new();
    let walker = WalkDir::new(&root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == BACKUP_DIR));

    for entry in walker {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;
        let relative = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        let size = match kind {
            EntryKind::File => entry
                .metadata()
                .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?
                .len(),
            EntryKind::Dir => 0,
        };

        entries.insert(
            relative,
            TreeEntry {
                kind,
                full_path,
                size,
            },
        );
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(hasher.finalize())
}
