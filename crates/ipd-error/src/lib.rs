#![forbid(unsafe_code)]
//! Error types for in-place delta generation.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | Recoverable by caller? |
//! |-------|---------|------------------------|
//! | Bad input from the diff producer | `MalformedInput` | No, the producer is broken |
//! | Bug in the cutting/allocation logic | `InvariantViolation` | No, internal consistency check |
//! | Reading images or writing the blob | `Io`, `Format` | Yes, retry with another config |
//! | Caller configuration | `InvalidConfig`, `PartitionMismatch`, `UnsupportedVersion`, `Parse` | Yes |
//!
//! Running out of scratch space is *not* an error. The allocator degrades the
//! affected operation to a full replacement and reports it through the
//! generation statistics only.
//!
//! ## Design Constraints
//!
//! - `ipd-error` MUST NOT depend on `ipd-types` (no cyclic deps). A
//!   `ParseError` is carried as its string form in `Parse`.
//! - All string payloads are owned (`String`).
//! - [`IpdError::exit_code`] is exhaustive (no wildcard arms) so adding a
//!   variant is a compile error until it has an exit code.

use thiserror::Error;

/// Unified error type for all generation stages.
#[derive(Debug, Error)]
pub enum IpdError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation list handed to the scheduler is inconsistent.
    ///
    /// Two operations writing one block, an extent that runs past the
    /// partition, or an operation with nothing to write.
    #[error("malformed operation list at block {block}: {detail}")]
    MalformedInput { block: u64, detail: String },

    /// An internal post-condition failed (temp blocks left behind, a cut edge
    /// that already carried write-before extents, an order contradicting an
    /// edge).
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// Image or blob content that cannot be interpreted.
    #[error("invalid data: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    #[error("parse error: {0}")]
    Parse(String),

    /// Generation config failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Old and new partitions describe different partitions.
    #[error("partition mismatch: old={old} new={new}")]
    PartitionMismatch { old: String, new: String },

    /// Config asks for a payload version the in-place generator can't emit.
    #[error("unsupported payload version {major}.{minor}")]
    UnsupportedVersion { major: u64, minor: u32 },
}

impl IpdError {
    /// Shorthand for [`IpdError::MalformedInput`].
    #[must_use]
    pub fn malformed(block: u64, detail: impl Into<String>) -> Self {
        Self::MalformedInput {
            block,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`IpdError::InvariantViolation`].
    #[must_use]
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation(detail.into())
    }

    /// Whether the error signals a bug in this workspace rather than bad
    /// input or a failing environment.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Process exit code (sysexits values) used by the CLI.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) => 74,
            Self::MalformedInput { .. } | Self::Format(_) | Self::Parse(_) => 65,
            Self::InvariantViolation(_) => 70,
            Self::InvalidConfig(_)
            | Self::PartitionMismatch { .. }
            | Self::UnsupportedVersion { .. } => 78,
        }
    }
}

/// Result alias using `IpdError`.
pub type Result<T> = std::result::Result<T, IpdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping_covers_all_variants() {
        let cases: Vec<(IpdError, i32)> = vec![
            (IpdError::Io(std::io::Error::other("test")), 74),
            (IpdError::malformed(3, "written twice"), 65),
            (IpdError::invariant("temp blocks remain"), 70),
            (IpdError::Format("not block aligned".into()), 65),
            (IpdError::Parse("bad block size".into()), 65),
            (IpdError::InvalidConfig("partition_size".into()), 78),
            (
                IpdError::PartitionMismatch {
                    old: "root".into(),
                    new: "kernel".into(),
                },
                78,
            ),
            (IpdError::UnsupportedVersion { major: 2, minor: 3 }, 78),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.exit_code(), *expected, "wrong exit code for {error:?}");
        }
    }

    #[test]
    fn internal_errors_are_distinct_from_bad_input() {
        assert!(IpdError::invariant("x").is_internal());
        assert!(!IpdError::malformed(0, "x").is_internal());
        assert_ne!(
            IpdError::invariant("x").exit_code(),
            IpdError::malformed(0, "x").exit_code()
        );
    }

    #[test]
    fn display_formatting() {
        let err = IpdError::malformed(42, "already written by op 3");
        assert_eq!(
            err.to_string(),
            "malformed operation list at block 42: already written by op 3"
        );

        let inv = IpdError::invariant("temp block in vertex 7");
        assert_eq!(
            inv.to_string(),
            "internal invariant violated: temp block in vertex 7"
        );

        let version = IpdError::UnsupportedVersion { major: 2, minor: 0 };
        assert_eq!(version.to_string(), "unsupported payload version 2.0");

        let mismatch = IpdError::PartitionMismatch {
            old: "root".into(),
            new: "kernel".into(),
        };
        assert_eq!(mismatch.to_string(), "partition mismatch: old=root new=kernel");
    }
}
