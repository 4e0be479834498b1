//! Undo records and the file-system steps that produce them.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::action::ComRegistration;
use crate::error::UpdateError;
use crate::orchestrator::progress::Phase;
use crate::platform::ComRegistrar;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecord {
    /// Move the backup copy back over `target`.
    Restore { target: PathBuf, backup: PathBuf },
    /// `target` did not exist before the update.
    RemoveCreated { target: PathBuf },
    /// Directory created to hold a new file; removed again if empty.
    RemoveDir { dir: PathBuf },
    /// Reverse a registration change by applying `undo`.
    RestoreRegistration {
        target: PathBuf,
        undo: ComRegistration,
    },
}

impl UndoRecord {
    pub fn phase(&self) -> Phase {
        match self {
            UndoRecord::Restore { .. } => Phase::Restoring,
            UndoRecord::RemoveCreated { .. } | UndoRecord::RemoveDir { .. } => Phase::Removing,
            UndoRecord::RestoreRegistration { .. } => Phase::RestoringRegistration,
        }
    }

    pub fn undo<R: ComRegistrar>(&self, registrar: &R) -> Result<(), UpdateError> {
        match self {
            UndoRecord::Restore { target, backup } => move_file(backup, target)
                .map_err(|e| UpdateError::io("failed to restore backup to", target, e)),
            UndoRecord::RemoveCreated { target } => match fs::remove_file(target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(UpdateError::io("failed to remove added file", target, e)),
            },
            UndoRecord::RemoveDir { dir } => {
                match fs::remove_dir(dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    // Something else now lives there; leave it.
                    Err(e) => warn!(dir = %dir.display(), error = %e, "created directory not removed"),
                }
                Ok(())
            }
            UndoRecord::RestoreRegistration { target, undo } => {
                let result = match undo {
                    ComRegistration::Register => registrar.register(target),
                    ComRegistration::Unregister => registrar.unregister(target),
                };
                result
                    .map(|_| ())
                    .map_err(|reason| UpdateError::Registration {
                        path: target.display().to_string(),
                        reason,
                    })
            }
        }
    }
}

/// Rename, falling back to copy+remove when the paths are on different devices.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), UpdateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| UpdateError::io("failed to create directory", parent, e))?;
    }
    Ok(())
}

/// Copy `target` into the backup area; the original stays in place.
pub fn copy_to_backup(target: &Path, backup: &Path) -> Result<(), UpdateError> {
    ensure_parent(backup)?;
    fs::copy(target, backup).map_err(|e| UpdateError::io("failed to back up", target, e))?;
    Ok(())
}

/// Move `target` into the backup area, removing it from the tree.
pub fn move_to_backup(target: &Path, backup: &Path) -> Result<(), UpdateError> {
    ensure_parent(backup)?;
    move_file(target, backup).map_err(|e| UpdateError::io("failed to delete", target, e))
}

/// Create the missing ancestors of `target` below `root`, outermost first.
/// Returns the directories that were created.
pub fn create_parent_dirs(root: &Path, target: &Path) -> Result<Vec<PathBuf>, UpdateError> {
    let mut missing = Vec::new();
    let mut current = target.parent();
    while let Some(dir) = current {
        if dir == root || dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }
    missing.reverse();
    for dir in &missing {
        fs::create_dir(dir).map_err(|e| UpdateError::io("failed to create directory", dir, e))?;
    }
    Ok(missing)
}

/// Stage `bytes` next to `target` and rename over it, so a crash leaves
/// either the old or the new file, never a partial one.
pub fn write_atomic(target: &Path, bytes: &[u8], executable: bool) -> Result<(), UpdateError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)
        .map_err(|e| UpdateError::io("failed to stage file in", dir, e))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| UpdateError::io("failed to write staged copy of", target, e))?;

    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(staged.path(), meta.permissions())
            .map_err(|e| UpdateError::io("failed to copy permissions of", target, e))?,
        Err(_) => set_new_file_mode(staged.path(), executable)
            .map_err(|e| UpdateError::io("failed to set permissions of", target, e))?,
    }

    staged
        .persist(target)
        .map_err(|e| UpdateError::io("failed to replace", target, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_new_file_mode(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_new_file_mode(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}
