use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::action::{ActionSpec, UpdateFileAction};
use crate::checksum;
use crate::delta::{self, DiffOptions};
use crate::package::UpdatePackage;
use crate::util::{self, EntryKind, TreeEntry};

/// Payload key prefixes inside a package.
pub const FILES_PREFIX: &str = "files/";
pub const DELTAS_PREFIX: &str = "deltas/";

#[derive(Debug, Default)]
pub struct CreateSummary {
    pub files_added: usize,
    pub files_patched: usize,
    pub files_replaced: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub payload_bytes: u64,
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "ico" | "avif"
            // Media
            | "mp4" | "mkv" | "webm" | "mp3" | "aac" | "ogg" | "flac" | "opus"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar" | "cab" | "msi"
            // Zip-based containers
            | "docx" | "xlsx" | "pptx" | "jar" | "nupkg"
            | "woff" | "woff2" | "pdf"
        )
    )
}

/// Map a file, or `None` for an empty one.
fn load(entry: &TreeEntry) -> Result<Option<Mmap>> {
    if entry.size == 0 {
        return Ok(None);
    }
    util::mmap_file(&entry.full_path).map(Some)
}

struct Built {
    action: UpdateFileAction,
    payload_key: String,
    payload: Vec<u8>,
    patched: bool,
}

fn build_copy(rel_path: &str, data: &[u8]) -> Result<Built> {
    let key = format!("{FILES_PREFIX}{rel_path}");
    Ok(Built {
        action: ActionSpec::copy(rel_path, key.clone(), checksum::checksum(data)).build()?,
        payload_key: key,
        payload: data.to_vec(),
        patched: false,
    })
}

struct ModifiedInput {
    rel_path: String,
    old: TreeEntry,
    new: TreeEntry,
}

/// Hash to confirm the change, then delta-encode unless the file type or the
/// resulting size says a plain copy is better.
fn build_modified(input: &ModifiedInput, options: DiffOptions) -> Result<Option<Built>> {
    if input.old.size == input.new.size {
        let old_hash = util::hash_file_streaming(&input.old.full_path)?;
        let new_hash = util::hash_file_streaming(&input.new.full_path)?;
        if old_hash == new_hash {
            return Ok(None);
        }
    }

    let old_map = load(&input.old)?;
    let new_map = load(&input.new)?;
    let old_data: &[u8] = old_map.as_deref().unwrap_or(&[]);
    let new_data: &[u8] = new_map.as_deref().unwrap_or(&[]);

    if is_incompressible(&input.new.full_path) {
        return build_copy(&input.rel_path, new_data).map(Some);
    }

    let encoded = delta::encode(old_data, new_data, options);
    if encoded.len() >= new_data.len() {
        return build_copy(&input.rel_path, new_data).map(Some);
    }

    let key = format!("{DELTAS_PREFIX}{}", input.rel_path);
    let action = ActionSpec::patch(
        input.rel_path.as_str(),
        key.clone(),
        checksum::checksum(old_data),
        checksum::checksum(new_data),
    )
    .build()?;
    Ok(Some(Built {
        action,
        payload_key: key,
        payload: encoded,
        patched: true,
    }))
}

/// Create an update package by comparing `old_dir` (the installed version)
/// with `new_dir`. Uses Tokio for concurrent directory walks and Rayon for
/// parallel hashing/diffing.
///
/// Action order: deletions, then modified files, then added files.
pub async fn create_package(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    options: DiffOptions,
) -> Result<CreateSummary> {
    // Stage 1: Walk both trees concurrently
    let old_dir_owned = old_dir.to_path_buf();
    let new_dir_owned = new_dir.to_path_buf();

    let (old_entries, new_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::scan_tree(&old_dir_owned)),
        tokio::task::spawn_blocking(move || util::scan_tree(&new_dir_owned)),
    )?;
    let old_entries = old_entries?;
    let new_entries = new_entries?;

    // Stage 2: Classify. Only files become actions; directories follow from them.
    let is_file = |e: &TreeEntry| e.kind == EntryKind::File;

    let mut added: Vec<(String, PathBuf)> = Vec::new();
    let mut modified: Vec<ModifiedInput> = Vec::new();
    let mut deleted: Vec<String> = Vec::new();

    for (path, new) in new_entries.iter().filter(|&(_, e)| is_file(e)) {
        match old_entries.get(path) {
            Some(old) if is_file(old) => modified.push(ModifiedInput {
                rel_path: path.clone(),
                old: old.clone(),
                new: new.clone(),
            }),
            _ => added.push((path.clone(), new.full_path.clone())),
        }
    }
    for (path, _) in old_entries.iter().filter(|&(_, e)| is_file(e)) {
        if !new_entries.get(path).is_some_and(is_file) {
            deleted.push(path.clone());
        }
    }

    let candidates = modified.len();

    // Stage 3: Hash + diff (Rayon par_iter inside spawn_blocking).
    let (modified_results, added_results) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<Vec<Built>> {
            Ok(modified
                .par_iter()
                .map(|input| build_modified(input, options))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect())
        }),
        tokio::task::spawn_blocking(move || -> Result<Vec<Built>> {
            added
                .par_iter()
                .map(|(rel_path, full_path)| -> Result<Built> {
                    let data = std::fs::read(full_path)
                        .with_context(|| format!("Failed to read file: {}", full_path.display()))?;
                    build_copy(rel_path, &data)
                })
                .collect()
        }),
    )?;
    let modified_results = modified_results?;
    let added_results = added_results?;

    // Stage 4: Assemble actions in order
    let mut summary = CreateSummary {
        files_added: added_results.len(),
        files_deleted: deleted.len(),
        files_unchanged: candidates - modified_results.len(),
        ..CreateSummary::default()
    };
    let mut actions: Vec<UpdateFileAction> = Vec::new();
    let mut payloads: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for path in &deleted {
        actions.push(ActionSpec::delete(path.as_str()).build()?);
    }

    for built in modified_results {
        if built.patched {
            summary.files_patched += 1;
        } else {
            summary.files_replaced += 1;
        }
        summary.payload_bytes += built.payload.len() as u64;
        actions.push(built.action);
        payloads.insert(built.payload_key, built.payload);
    }
    for built in added_results {
        summary.payload_bytes += built.payload.len() as u64;
        actions.push(built.action);
        payloads.insert(built.payload_key, built.payload);
    }

    let package = UpdatePackage::new(actions, payloads);
    package.validate()?;
    package.write_to(output)?;

    Ok(summary)
}
