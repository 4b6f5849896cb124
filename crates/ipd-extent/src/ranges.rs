//! Unordered block-set algebra over extents.
//!
//! `ExtentRanges` keeps a minimal, sorted set of non-overlapping,
//! non-touching real ranges. Sparse holes and empty extents are ignored on
//! every add and subtract: they name no physical block.

use ipd_types::Extent;
use std::collections::BTreeMap;
use std::fmt;

/// Sorted set of disjoint block ranges with a cached block count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentRanges {
    /// start block -> number of blocks.
    ranges: BTreeMap<u64, u64>,
    blocks: u64,
}

/// Whether two real extents share at least one block.
#[must_use]
pub fn extents_overlap(a: Extent, b: Extent) -> bool {
    if a.is_sparse_hole() || b.is_sparse_hole() || a.num_blocks == 0 || b.num_blocks == 0 {
        return false;
    }
    a.start_block < b.end() && b.start_block < a.end()
}

/// Whether two real extents share a block or sit back to back.
#[must_use]
pub fn extents_overlap_or_touch(a: Extent, b: Extent) -> bool {
    if a.is_sparse_hole() || b.is_sparse_hole() {
        return false;
    }
    a.start_block <= b.end() && b.start_block <= a.end()
}

impl ExtentRanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of blocks in the set.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Union `extent` into the set, merging every range it overlaps or touches.
    pub fn add_extent(&mut self, extent: Extent) {
        if extent.is_sparse_hole() || extent.num_blocks == 0 {
            return;
        }
        let mut start = extent.start_block;
        let mut end = extent.end();

        let mut absorbed = Vec::new();
        if let Some((&prev_start, &prev_len)) = self.ranges.range(..start).next_back() {
            if prev_start + prev_len >= start {
                absorbed.push(prev_start);
            }
        }
        for (&range_start, _) in self.ranges.range(start..) {
            if range_start > end {
                break;
            }
            absorbed.push(range_start);
        }

        for range_start in absorbed {
            if let Some(range_len) = self.ranges.remove(&range_start) {
                self.blocks -= range_len;
                start = start.min(range_start);
                end = end.max(range_start + range_len);
            }
        }

        self.ranges.insert(start, end - start);
        self.blocks += end - start;
    }

    /// Remove every block of `extent` from the set, splitting ranges as needed.
    pub fn subtract_extent(&mut self, extent: Extent) {
        if extent.is_sparse_hole() || extent.num_blocks == 0 {
            return;
        }
        let start = extent.start_block;
        let end = extent.end();

        let mut affected = Vec::new();
        if let Some((&prev_start, &prev_len)) = self.ranges.range(..start).next_back() {
            if prev_start + prev_len > start {
                affected.push(prev_start);
            }
        }
        affected.extend(self.ranges.range(start..end).map(|(&range_start, _)| range_start));

        for range_start in affected {
            let Some(range_len) = self.ranges.remove(&range_start) else {
                continue;
            };
            self.blocks -= range_len;
            let range_end = range_start + range_len;
            if range_start < start {
                self.ranges.insert(range_start, start - range_start);
                self.blocks += start - range_start;
            }
            if range_end > end {
                self.ranges.insert(end, range_end - end);
                self.blocks += range_end - end;
            }
        }
    }

    pub fn add_block(&mut self, block: u64) {
        self.add_extent(Extent::new(block, 1));
    }

    pub fn subtract_block(&mut self, block: u64) {
        self.subtract_extent(Extent::new(block, 1));
    }

    pub fn add_extents(&mut self, extents: &[Extent]) {
        for &extent in extents {
            self.add_extent(extent);
        }
    }

    pub fn subtract_extents(&mut self, extents: &[Extent]) {
        for &extent in extents {
            self.subtract_extent(extent);
        }
    }

    pub fn add_ranges(&mut self, other: &ExtentRanges) {
        for extent in other.iter() {
            self.add_extent(extent);
        }
    }

    pub fn subtract_ranges(&mut self, other: &ExtentRanges) {
        for extent in other.iter() {
            self.subtract_extent(extent);
        }
    }

    #[must_use]
    pub fn contains_block(&self, block: u64) -> bool {
        self.ranges
            .range(..=block)
            .next_back()
            .is_some_and(|(&start, &len)| block < start + len)
    }

    /// Iterate ranges in ascending block order.
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.ranges
            .iter()
            .map(|(&start, &len)| Extent::new(start, len))
    }

    /// All ranges as a sorted extent list.
    #[must_use]
    pub fn extent_set(&self) -> Vec<Extent> {
        self.iter().collect()
    }

    /// Deterministically pick `count` blocks, lowest ranges first, splitting
    /// the last range if needed.
    ///
    /// Returns `None` when the set holds fewer than `count` blocks.
    #[must_use]
    pub fn extents_for_block_count(&self, count: u64) -> Option<Vec<Extent>> {
        if count > self.blocks {
            return None;
        }
        let mut out = Vec::new();
        let mut remaining = count;
        for extent in self.iter() {
            if remaining == 0 {
                break;
            }
            let take = extent.num_blocks.min(remaining);
            out.push(Extent::new(extent.start_block, take));
            remaining -= take;
        }
        Some(out)
    }
}

impl FromIterator<Extent> for ExtentRanges {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut ranges = Self::new();
        for extent in iter {
            ranges.add_extent(extent);
        }
        ranges
    }
}

impl fmt::Display for ExtentRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blocks:", self.blocks)?;
        for extent in self.iter() {
            write!(f, " {extent}")?;
        }
        Ok(())
    }
}
