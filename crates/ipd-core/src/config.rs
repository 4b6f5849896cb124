//! Payload generation configuration.

use ipd_error::{IpdError, Result};
use ipd_types::{BlockSize, IN_PLACE_PAYLOAD_VERSION, PayloadVersion};
use serde::{Deserialize, Serialize};

/// Default upper bound on the data covered by one generated operation.
pub const DEFAULT_SOFT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Knobs for one in-place payload generation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadGenerationConfig {
    /// Filesystem block size in bytes. Power of two in 512..=65536.
    pub block_size: u64,
    /// Size of the partition the payload is applied to. Blocks past the end
    /// of the larger image and below this size are free scratch space.
    /// `None` means the new image size.
    pub partition_size: Option<u64>,
    /// Preferred maximum number of bytes covered by one operation.
    pub soft_chunk_size: u64,
    /// Hard maximum number of bytes covered by one operation, if any.
    pub hard_chunk_size: Option<u64>,
    /// Payload version to emit. Only the in-place version is supported.
    pub version: PayloadVersion,
}

impl Default for PayloadGenerationConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSize::DEFAULT.as_u64(),
            partition_size: None,
            soft_chunk_size: DEFAULT_SOFT_CHUNK_SIZE,
            hard_chunk_size: None,
            version: IN_PLACE_PAYLOAD_VERSION,
        }
    }
}

impl PayloadGenerationConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| IpdError::InvalidConfig(format!("config is not valid JSON: {err}")))
    }

    pub fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size)
            .map_err(|err| IpdError::InvalidConfig(format!("block_size {}: {err}", self.block_size)))
    }

    /// Check every field that does not depend on the partitions.
    pub fn validate(&self) -> Result<()> {
        let block_size = self.block_size()?;
        if self.version != IN_PLACE_PAYLOAD_VERSION {
            return Err(IpdError::UnsupportedVersion {
                major: self.version.major,
                minor: self.version.minor,
            });
        }
        if self.soft_chunk_size < block_size.as_u64() {
            return Err(IpdError::InvalidConfig(format!(
                "soft_chunk_size {} is smaller than one block",
                self.soft_chunk_size
            )));
        }
        if let Some(hard) = self.hard_chunk_size {
            if hard < block_size.as_u64() {
                return Err(IpdError::InvalidConfig(format!(
                    "hard_chunk_size {hard} is smaller than one block"
                )));
            }
        }
        if let Some(size) = self.partition_size {
            if !block_size.is_aligned(size) {
                return Err(IpdError::InvalidConfig(format!(
                    "partition_size {size} is not a multiple of block_size {block_size}"
                )));
            }
        }
        Ok(())
    }

    /// Partition size to plan scratch space against. Both images must fit.
    pub fn effective_partition_size(&self, old_size: u64, new_size: u64) -> Result<u64> {
        let size = self.partition_size.unwrap_or(new_size);
        let needed = old_size.max(new_size);
        if size < needed {
            return Err(IpdError::InvalidConfig(format!(
                "partition_size {size} is smaller than the images it holds ({needed} bytes)"
            )));
        }
        Ok(size)
    }

    /// Maximum number of blocks one generated operation may cover: the soft
    /// chunk size, capped by the hard chunk size. At least one.
    pub fn chunk_blocks(&self) -> Result<u64> {
        let block_size = self.block_size()?;
        let bytes = self
            .hard_chunk_size
            .map_or(self.soft_chunk_size, |hard| hard.min(self.soft_chunk_size));
        Ok(block_size.blocks_in(bytes).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PayloadGenerationConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.chunk_blocks().expect("chunk"), 512);
    }

    #[test]
    fn rejects_bad_block_size() {
        let config = PayloadGenerationConfig {
            block_size: 3000,
            ..PayloadGenerationConfig::default()
        };
        assert!(matches!(config.validate(), Err(IpdError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_other_payload_versions() {
        let config = PayloadGenerationConfig {
            version: PayloadVersion { major: 2, minor: 3 },
            ..PayloadGenerationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(IpdError::UnsupportedVersion { major: 2, minor: 3 })
        ));
    }

    #[test]
    fn rejects_unaligned_partition_and_tiny_chunks() {
        let unaligned = PayloadGenerationConfig {
            partition_size: Some(4096 * 10 + 1),
            ..PayloadGenerationConfig::default()
        };
        assert!(unaligned.validate().is_err());

        let tiny_hard = PayloadGenerationConfig {
            hard_chunk_size: Some(100),
            ..PayloadGenerationConfig::default()
        };
        assert!(tiny_hard.validate().is_err());
    }

    #[test]
    fn hard_chunk_caps_soft_chunk() {
        let config = PayloadGenerationConfig {
            hard_chunk_size: Some(4096 * 3),
            ..PayloadGenerationConfig::default()
        };
        assert_eq!(config.chunk_blocks().expect("chunk"), 3);
    }

    #[test]
    fn partition_size_must_cover_both_images() {
        let config = PayloadGenerationConfig::default();
        assert_eq!(config.effective_partition_size(4096 * 2, 4096 * 8).expect("size"), 4096 * 8);
        assert!(config.effective_partition_size(4096 * 9, 4096 * 8).is_err());

        let small = PayloadGenerationConfig {
            partition_size: Some(4096 * 4),
            ..PayloadGenerationConfig::default()
        };
        assert!(small.effective_partition_size(4096, 4096 * 8).is_err());
        let roomy = PayloadGenerationConfig {
            partition_size: Some(4096 * 16),
            ..PayloadGenerationConfig::default()
        };
        assert_eq!(roomy.effective_partition_size(4096, 4096 * 8).expect("size"), 4096 * 16);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config =
            PayloadGenerationConfig::from_json(r#"{"block_size": 1024, "partition_size": 65536}"#)
                .expect("parse");
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.partition_size, Some(65536));
        assert_eq!(config.soft_chunk_size, DEFAULT_SOFT_CHUNK_SIZE);
        assert_eq!(config.version, IN_PLACE_PAYLOAD_VERSION);
        assert!(PayloadGenerationConfig::from_json("{not json").is_err());
    }
}
