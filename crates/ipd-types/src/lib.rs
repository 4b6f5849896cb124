#![forbid(unsafe_code)]
//! Core value types shared by every in-place delta crate.
//!
//! Extents, operations, partition descriptions and the two reserved block
//! address constants live here so that graph, allocator and I/O crates agree
//! on a single representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ── Reserved block addresses ────────────────────────────────────────────────

/// Start value of an extent that has no physical backing (a hole in a sparse
/// file). Never a real address and never counted toward edge weight.
pub const SPARSE_HOLE: u64 = u64::MAX;

/// First address of the virtual space used for not-yet-resolved temp blocks.
///
/// Real partitions never reach this address. Every extent that starts in
/// `[TEMP_BLOCK_START, SPARSE_HOLE)` must be rewritten before a generation run
/// finishes.
pub const TEMP_BLOCK_START: u64 = 1 << 60;

/// The only payload version this generator emits.
pub const IN_PLACE_PAYLOAD_VERSION: PayloadVersion = PayloadVersion { major: 1, minor: 1 };

// ── Extent ──────────────────────────────────────────────────────────────────

/// Contiguous range of blocks on a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    /// A sparse-hole extent covering `num_blocks` logical blocks.
    #[must_use]
    pub const fn sparse_hole(num_blocks: u64) -> Self {
        Self::new(SPARSE_HOLE, num_blocks)
    }

    #[must_use]
    pub fn is_sparse_hole(self) -> bool {
        self.start_block == SPARSE_HOLE
    }

    /// Whether any block of this extent lies in the virtual temp space.
    #[must_use]
    pub fn touches_temp_space(self) -> bool {
        if self.is_sparse_hole() || self.num_blocks == 0 {
            return false;
        }
        self.start_block >= TEMP_BLOCK_START
            || self.start_block.saturating_add(self.num_blocks) > TEMP_BLOCK_START
    }

    /// One past the last block, or `None` on overflow.
    #[must_use]
    pub fn checked_end(self) -> Option<u64> {
        self.start_block.checked_add(self.num_blocks)
    }

    /// Exclusive end block. Saturates for sparse holes.
    #[must_use]
    pub fn end(self) -> u64 {
        self.start_block.saturating_add(self.num_blocks)
    }

    #[must_use]
    pub fn contains(self, block: u64) -> bool {
        !self.is_sparse_hole() && block >= self.start_block && block < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sparse_hole() {
            write!(f, "(hole, {})", self.num_blocks)
        } else {
            write!(f, "({}, {})", self.start_block, self.num_blocks)
        }
    }
}

// ── Block size ──────────────────────────────────────────────────────────────

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const DEFAULT: Self = Self(4096);

    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u64) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        let value = u32::try_from(value).map_err(|_| ParseError::IntegerConversion {
            field: "block_size",
        })?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Number of whole blocks in `bytes` (truncating).
    #[must_use]
    pub fn blocks_in(self, bytes: u64) -> u64 {
        bytes >> u64::from(self.shift())
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: u64) -> Option<u64> {
        block.checked_mul(self.as_u64())
    }

    #[must_use]
    pub fn is_aligned(self, bytes: u64) -> bool {
        bytes & (self.as_u64() - 1) == 0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

/// Kind of install operation. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Copy blocks inside the partition.
    Move,
    /// Binary patch of source blocks.
    Bsdiff,
    /// Write raw data from the blob.
    Replace,
    /// Write bzip2-compressed data from the blob.
    ReplaceBz,
}

impl OperationType {
    /// Full operations do not read the partition at all.
    #[must_use]
    pub fn is_full(self) -> bool {
        matches!(self, Self::Replace | Self::ReplaceBz)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Move => "MOVE",
            Self::Bsdiff => "BSDIFF",
            Self::Replace => "REPLACE",
            Self::ReplaceBz => "REPLACE_BZ",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single block-level install operation.
///
/// `data_offset`/`data_length` locate the payload in the blob file for
/// REPLACE and REPLACE_BZ. `src_length`/`dst_length` are byte counts and are
/// only meaningful for MOVE and BSDIFF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub src_extents: Vec<Extent>,
    #[serde(default)]
    pub dst_extents: Vec<Extent>,
    #[serde(default)]
    pub data_offset: u64,
    #[serde(default)]
    pub data_length: u64,
    #[serde(default)]
    pub src_length: u64,
    #[serde(default)]
    pub dst_length: u64,
}

impl InstallOperation {
    #[must_use]
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            src_extents: Vec::new(),
            dst_extents: Vec::new(),
            data_offset: 0,
            data_length: 0,
            src_length: 0,
            dst_length: 0,
        }
    }

    #[must_use]
    pub fn with_extents(op_type: OperationType, src: Vec<Extent>, dst: Vec<Extent>) -> Self {
        Self {
            src_extents: src,
            dst_extents: dst,
            ..Self::new(op_type)
        }
    }

    /// Start block of the first destination extent, used to order full ops.
    #[must_use]
    pub fn first_dst_block(&self) -> Option<u64> {
        self.dst_extents.first().map(|extent| extent.start_block)
    }
}

/// An operation plus a human-readable label (usually the file it came from).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedOperation {
    pub name: String,
    pub op: InstallOperation,
}

impl AnnotatedOperation {
    #[must_use]
    pub fn new(name: impl Into<String>, op: InstallOperation) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }
}

// ── Partitions & versions ───────────────────────────────────────────────────

/// One side (old or new) of a partition pair being diffed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    pub path: PathBuf,
    /// Size in bytes of the partition image.
    pub size: u64,
}

impl PartitionConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
        }
    }
}

/// Payload format version (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadVersion {
    pub major: u64,
    pub minor: u32,
}

impl Default for PayloadVersion {
    fn default() -> Self {
        IN_PLACE_PAYLOAD_VERSION
    }
}

impl fmt::Display for PayloadVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ── Validation errors ───────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_accepts_powers_of_two_in_range() {
        assert_eq!(BlockSize::new(4096).unwrap().get(), 4096);
        assert_eq!(BlockSize::new(512).unwrap().shift(), 9);
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.blocks_in(8192), 2);
        assert_eq!(bs.blocks_in(8191), 1);
        assert_eq!(bs.block_to_byte(3), Some(12_288));
        assert_eq!(bs.block_to_byte(u64::MAX), None);
        assert!(bs.is_aligned(40_960));
        assert!(!bs.is_aligned(40_961));
    }

    #[test]
    fn temp_space_detection() {
        assert!(!Extent::new(0, 10).touches_temp_space());
        assert!(Extent::new(TEMP_BLOCK_START, 1).touches_temp_space());
        assert!(Extent::new(TEMP_BLOCK_START - 1, 2).touches_temp_space());
        assert!(!Extent::new(TEMP_BLOCK_START - 1, 1).touches_temp_space());
        assert!(!Extent::sparse_hole(4).touches_temp_space());
    }

    #[test]
    fn extent_contains_ignores_holes() {
        let extent = Extent::new(10, 5);
        assert!(extent.contains(10));
        assert!(extent.contains(14));
        assert!(!extent.contains(15));
        assert!(!Extent::sparse_hole(3).contains(SPARSE_HOLE));
    }

    #[test]
    fn full_operation_classification() {
        assert!(OperationType::Replace.is_full());
        assert!(OperationType::ReplaceBz.is_full());
        assert!(!OperationType::Move.is_full());
        assert!(!OperationType::Bsdiff.is_full());
    }

    #[test]
    fn operation_type_serializes_upper_snake() {
        let json = serde_json::to_string(&OperationType::ReplaceBz).unwrap();
        assert_eq!(json, "\"REPLACE_BZ\"");
        let op: InstallOperation =
            serde_json::from_str(r#"{"type":"MOVE","src_extents":[{"start_block":1,"num_blocks":2}]}"#)
                .unwrap();
        assert_eq!(op.op_type, OperationType::Move);
        assert_eq!(op.src_extents, vec![Extent::new(1, 2)]);
        assert!(op.dst_extents.is_empty());
    }

    #[test]
    fn extent_display() {
        assert_eq!(Extent::new(7, 3).to_string(), "(7, 3)");
        assert_eq!(Extent::sparse_hole(4).to_string(), "(hole, 4)");
    }
}
