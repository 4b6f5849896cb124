//! Seeded round-trip stress: generate, apply in place, compare.

use crate::apply::{ApplyReport, apply_operations, check_operations};
use crate::fixtures::{DeterministicRng, ImagePair, ImagePairConfig, generate_image_pair};
use anyhow::{Context, Result, bail};
use ipd_block::{BlobFileWriter, MemoryByteDevice};
use ipd_core::{BlockDiffProducer, GenerationStats, PayloadGenerationConfig, generate_for_devices};
use ipd_types::BlockSize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundTripConfig {
    /// Number of image pairs to try.
    pub iterations: u64,
    /// Seed used to derive per-case seeds.
    pub seed: u64,
    pub image: ImagePairConfig,
    /// Free blocks past the larger image.
    pub scratch_blocks: u64,
    /// Optional hard cap on blocks per operation.
    pub hard_chunk_blocks: Option<u64>,
    /// Where to drop the images of a failing case.
    pub output_dir: Option<PathBuf>,
}

impl Default for RoundTripConfig {
    fn default() -> Self {
        Self {
            iterations: 64,
            seed: 0x1AD0_5EED_0000_0001,
            image: ImagePairConfig::default(),
            scratch_blocks: 4,
            hard_chunk_blocks: None,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundTripCase {
    pub seed: u64,
    pub stats: GenerationStats,
    pub apply: ApplyReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundTripFailure {
    pub iteration: u64,
    pub seed: u64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundTripReport {
    pub seed: u64,
    pub iterations: u64,
    pub cases_passed: u64,
    pub passed: bool,
    pub total_cuts: u64,
    pub total_full_conversions: u64,
    pub total_scratch_blocks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RoundTripFailure>,
    pub duration_us: u64,
    pub output_dir: Option<String>,
}

fn first_mismatch(actual: &[u8], expected: &[u8], block_size: usize) -> Option<usize> {
    actual
        .chunks(block_size)
        .zip(expected.chunks(block_size))
        .position(|(a, e)| a != e)
}

/// Generate operations for `pair`, apply them to a copy of the old image
/// padded to the partition size, and check the result.
pub fn run_round_trip_pair(
    pair: &ImagePair,
    config: &RoundTripConfig,
) -> Result<(GenerationStats, ApplyReport)> {
    let bs = config.image.block_size;
    let block_size = BlockSize::new(bs as u64).context("image block size")?;
    let image_blocks = (pair.old.len().max(pair.new.len()) / bs) as u64;
    let partition_blocks = image_blocks + config.scratch_blocks;
    let partition_size = partition_blocks * bs as u64;
    let gen_config = PayloadGenerationConfig {
        block_size: bs as u64,
        partition_size: Some(partition_size),
        hard_chunk_size: config.hard_chunk_blocks.map(|blocks| blocks * bs as u64),
        ..PayloadGenerationConfig::default()
    };

    let old_dev = MemoryByteDevice::new(pair.old.clone());
    let new_dev = MemoryByteDevice::new(pair.new.clone());
    let mut blob = BlobFileWriter::in_memory();
    let (ops, stats) =
        generate_for_devices(&gen_config, &old_dev, &new_dev, &BlockDiffProducer, &mut blob)
            .context("generation failed")?;
    let blob = blob.finish()?;
    check_operations(&ops, partition_blocks)?;

    let mut target = pair.old.clone();
    target.resize(usize::try_from(partition_size)?, 0);
    let target_dev = MemoryByteDevice::new(target);
    let report = apply_operations(&target_dev, &ops, &blob, block_size)?;
    let result = target_dev.into_inner();
    if let Some(block) = first_mismatch(&result[..pair.new.len()], &pair.new, bs) {
        bail!(
            "applied image differs from new image at block {block} ({} operations)",
            ops.len()
        );
    }
    Ok((stats, report))
}

pub fn run_round_trip_case(config: &RoundTripConfig, seed: u64) -> Result<RoundTripCase> {
    let pair = generate_image_pair(&config.image, seed);
    let (stats, apply) = run_round_trip_pair(&pair, config)?;
    Ok(RoundTripCase { seed, stats, apply })
}

fn dump_failing_pair(config: &RoundTripConfig, seed: u64) -> Result<Option<String>> {
    let Some(dir) = &config.output_dir else {
        return Ok(None);
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let pair = generate_image_pair(&config.image, seed);
    fs::write(dir.join(format!("{seed:016x}.old.img")), &pair.old)?;
    fs::write(dir.join(format!("{seed:016x}.new.img")), &pair.new)?;
    Ok(Some(dir.display().to_string()))
}

/// Run `config.iterations` cases, stopping at the first failure.
pub fn run_round_trip_stress(config: &RoundTripConfig) -> Result<RoundTripReport> {
    let started = Instant::now();
    let mut rng = DeterministicRng::new(config.seed);
    let mut report = RoundTripReport {
        seed: config.seed,
        iterations: config.iterations,
        cases_passed: 0,
        passed: true,
        total_cuts: 0,
        total_full_conversions: 0,
        total_scratch_blocks: 0,
        failure: None,
        duration_us: 0,
        output_dir: None,
    };

    for iteration in 0..config.iterations {
        let seed = rng.next_u64();
        match run_round_trip_case(config, seed) {
            Ok(case) => {
                debug!(
                    iteration,
                    seed,
                    operations = case.stats.operations,
                    cuts = case.stats.cuts,
                    "round_trip_case_passed"
                );
                report.cases_passed += 1;
                report.total_cuts += case.stats.cuts as u64;
                report.total_full_conversions += case.stats.full_conversions as u64;
                report.total_scratch_blocks += case.stats.scratch_blocks;
            }
            Err(err) => {
                warn!(iteration, seed, error = %format!("{err:#}"), "round_trip_case_failed");
                report.passed = false;
                report.failure = Some(RoundTripFailure {
                    iteration,
                    seed,
                    error: format!("{err:#}"),
                });
                report.output_dir = dump_failing_pair(config, seed)?;
                break;
            }
        }
    }

    report.duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    info!(
        iterations = report.iterations,
        cases_passed = report.cases_passed,
        total_cuts = report.total_cuts,
        total_full_conversions = report.total_full_conversions,
        "round_trip_stress_done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_stress_run_passes() {
        let config = RoundTripConfig {
            iterations: 6,
            image: ImagePairConfig {
                old_blocks: 40,
                new_blocks: 40,
                ..ImagePairConfig::default()
            },
            ..RoundTripConfig::default()
        };
        let report = run_round_trip_stress(&config).expect("stress");
        assert!(report.passed, "{:?}", report.failure);
        assert_eq!(report.cases_passed, 6);
        assert!(report.total_cuts > 0);
    }

    #[test]
    fn mismatch_is_located_by_block() {
        assert_eq!(first_mismatch(&[0, 0, 1, 1], &[0, 0, 1, 2], 2), Some(1));
        assert_eq!(first_mismatch(&[5; 4], &[5; 4], 2), None);
    }
}
