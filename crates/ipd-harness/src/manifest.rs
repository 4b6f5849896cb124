//! JSON manifest describing one generated payload.

use anyhow::{Context, Result, bail};
use ipd_core::GenerationStats;
use ipd_types::{AnnotatedOperation, BlockSize, IN_PLACE_PAYLOAD_VERSION, PayloadVersion};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Ordered operations for one partition plus what is needed to apply them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadManifest {
    pub version: PayloadVersion,
    pub partition_name: String,
    pub block_size: u64,
    pub old_size: u64,
    pub new_size: u64,
    pub partition_size: u64,
    /// Lowercase hex blake3 digest of the blob file.
    pub blob_blake3: String,
    pub blob_size: u64,
    pub stats: GenerationStats,
    pub operations: Vec<AnnotatedOperation>,
}

#[must_use]
pub fn blob_digest(blob: &[u8]) -> String {
    hex::encode(blake3::hash(blob).as_bytes())
}

impl PayloadManifest {
    pub fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size)
            .with_context(|| format!("manifest block_size {}", self.block_size))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text).context("invalid manifest json")?;
        if manifest.version != IN_PLACE_PAYLOAD_VERSION {
            bail!(
                "manifest version {} is not the in-place version {IN_PLACE_PAYLOAD_VERSION}",
                manifest.version
            );
        }
        Ok(manifest)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("manifest {}", path.display()))
    }

    /// Fail unless `blob` is the blob this manifest was generated with.
    pub fn verify_blob(&self, blob: &[u8]) -> Result<()> {
        let digest = blob_digest(blob);
        if blob.len() as u64 != self.blob_size || digest != self.blob_blake3 {
            bail!(
                "blob mismatch: {} bytes ({digest}), manifest expects {} bytes ({})",
                blob.len(),
                self.blob_size,
                self.blob_blake3
            );
        }
        Ok(())
    }
}
