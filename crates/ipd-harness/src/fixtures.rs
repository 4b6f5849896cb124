//! Test image builders.
//!
//! Two sources: sparse JSON fixtures (a zeroed image plus hex patches) and
//! seeded synthetic image pairs whose new image is a scrambled copy of the
//! old one, so that the generated operations form dependency cycles.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

impl SparseFixture {
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.size];
        for write in &self.writes {
            let payload = hex::decode(&write.hex)
                .with_context(|| format!("invalid hex at offset {}", write.offset))?;
            let end = write
                .offset
                .checked_add(payload.len())
                .context("fixture offset overflow")?;
            if end > bytes.len() {
                bail!(
                    "fixture write out of bounds: offset={} payload={} size={}",
                    write.offset,
                    payload.len(),
                    bytes.len()
                );
            }
            bytes[write.offset..end].copy_from_slice(&payload);
        }
        Ok(bytes)
    }
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    fixture.render()
}

// ── Synthetic image pairs ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `0..upper_exclusive`; 0 when the range is empty.
    pub fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive <= 1 {
            return 0;
        }
        let upper_u64 = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        let value = self.next_u64() % upper_u64;
        usize::try_from(value).unwrap_or(0)
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Shape of a synthetic old/new image pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImagePairConfig {
    pub block_size: usize,
    pub old_blocks: usize,
    pub new_blocks: usize,
    /// Rotations of a random block range (each yields a two-MOVE cycle).
    pub rotations: usize,
    /// Exchanges of two equal-length block ranges.
    pub swaps: usize,
    /// Blocks replaced with fresh content.
    pub fresh_blocks: usize,
    /// Longest range touched by one rotation or swap.
    pub max_run: usize,
}

impl Default for ImagePairConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            old_blocks: 128,
            new_blocks: 128,
            rotations: 4,
            swaps: 4,
            fresh_blocks: 8,
            max_run: 12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImagePair {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Build an image pair. Every old block holds distinct random content; each
/// new block is either a copy of some old block or fresh random content.
#[must_use]
pub fn generate_image_pair(config: &ImagePairConfig, seed: u64) -> ImagePair {
    let mut rng = DeterministicRng::new(seed);
    let bs = config.block_size;
    let mut old = vec![0_u8; config.old_blocks * bs];
    rng.fill(&mut old);

    // Source old block for every new block; `None` is fresh content.
    let mut layout: Vec<Option<usize>> = (0..config.new_blocks)
        .map(|block| (block < config.old_blocks).then_some(block))
        .collect();
    let len = layout.len();
    let max_run = config.max_run.max(2);

    for _ in 0..config.rotations {
        if len < 3 {
            break;
        }
        let start = 1 + rng.next_usize(len - 2);
        let run = 2 + rng.next_usize(max_run.min(len - start) - 1);
        let end = (start + run).min(len);
        let by = 1 + rng.next_usize(end - start - 1);
        layout[start..end].rotate_left(by);
    }
    for _ in 0..config.swaps {
        let run = 1 + rng.next_usize(max_run / 2);
        if len < 2 * run + 1 {
            break;
        }
        let a = 1 + rng.next_usize(len - 2 * run);
        let b_min = a + run;
        let b = b_min + rng.next_usize(len - run - b_min + 1);
        for offset in 0..run {
            layout.swap(a + offset, b + offset);
        }
    }
    for _ in 0..config.fresh_blocks {
        let block = rng.next_usize(len);
        layout[block] = None;
    }

    let mut new = vec![0_u8; len * bs];
    for (block, source) in layout.iter().enumerate() {
        let dst = &mut new[block * bs..(block + 1) * bs];
        match source {
            Some(src) => dst.copy_from_slice(&old[src * bs..(src + 1) * bs]),
            None => rng.fill(dst),
        }
    }
    ImagePair { old, new }
}
