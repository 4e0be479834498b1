use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use crate::action::{validate_actions, UpdateFileAction};
use crate::util;

pub const MAGIC: &[u8; 8] = b"UPDPKG01";
pub const FORMAT_VERSION: u32 = 1;
const ZSTD_LEVEL: i32 = 3;

/// Resolves the payload references held by actions.
pub trait PayloadStore {
    fn payload(&self, reference: &str) -> Option<&[u8]>;
}

impl PayloadStore for BTreeMap<String, Vec<u8>> {
    fn payload(&self, reference: &str) -> Option<&[u8]> {
        self.get(reference).map(Vec::as_slice)
    }
}

impl PayloadStore for HashMap<String, Vec<u8>> {
    fn payload(&self, reference: &str) -> Option<&[u8]> {
        self.get(reference).map(Vec::as_slice)
    }
}

/// Ordered actions plus the copy and delta payloads they reference.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub version: u32,
    pub actions: Vec<UpdateFileAction>,
    pub payloads: BTreeMap<String, Vec<u8>>,
}

impl PayloadStore for UpdatePackage {
    fn payload(&self, reference: &str) -> Option<&[u8]> {
        self.payloads.payload(reference)
    }
}

impl UpdatePackage {
    pub fn new(actions: Vec<UpdateFileAction>, payloads: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            version: FORMAT_VERSION,
            actions,
            payloads,
        }
    }

    /// Every referenced payload must be present and paths must be unique.
    pub fn validate(&self) -> Result<()> {
        validate_actions(&self.actions)?;
        for action in &self.actions {
            if let Some(reference) = action.operation().payload_ref() {
                if !self.payloads.contains_key(reference) {
                    bail!(
                        "Package action '{}' references missing payload '{}'",
                        action.path(),
                        reference
                    );
                }
            }
        }
        Ok(())
    }

    pub fn write_to(&self, output: &Path) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to serialize package")?;
        let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)
            .context("Failed to compress package data")?;

        let mut file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create package file: {}", output.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;
        Ok(())
    }

    /// mmap the package, check magic, then stream-decompress into bincode.
    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = util::mmap_file(path)?;

        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            bail!("Invalid package file: missing magic header");
        }

        let decoder =
            zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
        let package: UpdatePackage =
            bincode::deserialize_from(decoder).context("Failed to deserialize package")?;

        if package.version != FORMAT_VERSION {
            bail!(
                "Unsupported package version: {} (expected {})",
                package.version,
                FORMAT_VERSION
            );
        }
        package.validate()?;
        Ok(package)
    }
}
