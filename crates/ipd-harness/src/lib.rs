#![forbid(unsafe_code)]
//! Verification harness for in-place payloads.
//!
//! Applies generated operation lists to a copy of the old image the way an
//! updater would and checks the result byte for byte against the new image.

pub mod apply;
pub mod fixtures;
pub mod manifest;
pub mod stress;

pub use apply::{ApplyReport, apply_operations, check_operations};
pub use fixtures::{
    DeterministicRng, FixtureWrite, ImagePair, ImagePairConfig, SparseFixture,
    generate_image_pair, load_sparse_fixture,
};
pub use manifest::{PayloadManifest, blob_digest};
pub use stress::{
    RoundTripCase, RoundTripConfig, RoundTripFailure, RoundTripReport, run_round_trip_case,
    run_round_trip_pair, run_round_trip_stress,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Outcome of replaying one checked-in fixture pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePairReport {
    pub old_fixture: String,
    pub new_fixture: String,
    pub case: RoundTripCase,
}

/// Render `old` and `new` sparse fixtures and run them through the
/// generate/apply/compare loop.
pub fn check_fixture_pair(
    old: &Path,
    new: &Path,
    config: &RoundTripConfig,
) -> Result<FixturePairReport> {
    let pair = ImagePair {
        old: load_sparse_fixture(old)?,
        new: load_sparse_fixture(new)?,
    };
    let bs = config.image.block_size;
    if pair.old.len() % bs != 0 || pair.new.len() % bs != 0 {
        bail!(
            "fixture sizes {} and {} are not multiples of block size {bs}",
            pair.old.len(),
            pair.new.len()
        );
    }
    let (stats, apply) = run_round_trip_pair(&pair, config)
        .with_context(|| format!("fixture pair {} -> {}", old.display(), new.display()))?;
    Ok(FixturePairReport {
        old_fixture: old.display().to_string(),
        new_fixture: new.display().to_string(),
        case: RoundTripCase {
            seed: 0,
            stats,
            apply,
        },
    })
}
