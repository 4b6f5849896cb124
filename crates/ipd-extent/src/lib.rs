#![forbid(unsafe_code)]
//! Extent utilities: block-list expansion, recompression, counting.
//!
//! Operation extents are *ordered* lists: the order is the order in which an
//! operation reads or writes blocks, so two lists with the same blocks in a
//! different order are different. Unordered set algebra lives in
//! [`ranges::ExtentRanges`].
//!
//! Sparse holes (`start_block == SPARSE_HOLE`) carry a length but no address.
//! They are expanded to repeated `SPARSE_HOLE` entries, contribute zero weight,
//! and only ever merge with other holes.

pub mod ranges;

pub use ranges::ExtentRanges;

use ipd_types::{Extent, SPARSE_HOLE};

// ── Ordered extent lists ────────────────────────────────────────────────────

/// Append `block` to `extents`, extending the last extent when `block` is the
/// next block after it (or when both are sparse holes).
pub fn append_block_to_extents(extents: &mut Vec<Extent>, block: u64) {
    if let Some(last) = extents.last_mut() {
        let extends = if last.is_sparse_hole() {
            block == SPARSE_HOLE
        } else {
            block != SPARSE_HOLE && last.checked_end() == Some(block)
        };
        if extends {
            last.num_blocks += 1;
            return;
        }
    }
    extents.push(Extent::new(block, 1));
}

/// Expand extents into one entry per block, preserving order.
///
/// Each block of a sparse-hole extent becomes a `SPARSE_HOLE` entry.
#[must_use]
pub fn expand_extents(extents: &[Extent]) -> Vec<u64> {
    let total = usize::try_from(blocks_in_extents(extents)).unwrap_or(0);
    let mut blocks = Vec::with_capacity(total);
    for extent in extents {
        if extent.is_sparse_hole() {
            for _ in 0..extent.num_blocks {
                blocks.push(SPARSE_HOLE);
            }
        } else {
            blocks.extend(extent.start_block..extent.end());
        }
    }
    blocks
}

/// Compress a block list back into the minimal ordered extent list.
#[must_use]
pub fn compress_extents(blocks: &[u64]) -> Vec<Extent> {
    let mut extents = Vec::new();
    for &block in blocks {
        append_block_to_extents(&mut extents, block);
    }
    extents
}

/// Total number of blocks described, sparse holes included.
#[must_use]
pub fn blocks_in_extents(extents: &[Extent]) -> u64 {
    extents.iter().map(|extent| extent.num_blocks).sum()
}

/// Number of real (non-hole) blocks described. This is the weight of an
/// edge.
#[must_use]
pub fn real_blocks_in_extents(extents: &[Extent]) -> u64 {
    extents
        .iter()
        .filter(|extent| !extent.is_sparse_hole())
        .map(|extent| extent.num_blocks)
        .sum()
}

/// Merge adjacent extents in place without reordering anything.
pub fn normalize_extents(extents: &mut Vec<Extent>) {
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents.drain(..) {
        if extent.num_blocks == 0 {
            continue;
        }
        if let Some(last) = merged.last_mut() {
            let adjacent = if last.is_sparse_hole() {
                extent.is_sparse_hole()
            } else {
                !extent.is_sparse_hole() && last.checked_end() == Some(extent.start_block)
            };
            if adjacent {
                last.num_blocks += extent.num_blocks;
                continue;
            }
        }
        merged.push(extent);
    }
    *extents = merged;
}

/// Whether any extent references a block in the virtual temp space.
#[must_use]
pub fn temp_blocks_exist_in_extents(extents: &[Extent]) -> bool {
    extents.iter().any(|extent| extent.touches_temp_space())
}

/// Human-readable list, e.g. `[(4, 3), (hole, 2)]`.
#[must_use]
pub fn extents_to_string(extents: &[Extent]) -> String {
    let parts: Vec<String> = extents.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}
