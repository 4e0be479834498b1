use std::path::{Path, PathBuf};

use crate::action::Architecture;

/// Default backup directory name, created under the update root.
pub const BACKUP_DIR: &str = ".update-backup";

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Directory that action paths are relative to.
    pub root: PathBuf,
    /// Where replaced and deleted files are kept until the run ends.
    pub backup_dir: Option<PathBuf>,
    pub host: Architecture,
    /// Keep the backup directory after a completed run.
    pub keep_backups: bool,
}

impl UpdateConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup_dir: None,
            host: Architecture::host(),
            keep_backups: false,
        }
    }

    pub fn with_host(mut self, host: Architecture) -> Self {
        self.host = host;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn keep_backups(mut self, keep: bool) -> Self {
        self.keep_backups = keep;
        self
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.root.join(BACKUP_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
