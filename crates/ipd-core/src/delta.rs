//! Raw delta producers: turn an old/new image pair into operations before
//! any in-place ordering is applied.

use crate::config::PayloadGenerationConfig;
use ipd_block::{BlobFileWriter, ByteDevice, write_full_replace};
use ipd_error::{IpdError, Result};
use ipd_types::{AnnotatedOperation, BlockSize, Extent, InstallOperation, OperationType};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use tracing::{debug, info};

/// Produces raw operations for one partition pair.
///
/// Output operations may read and write overlapping blocks in any order;
/// the generator orders them afterwards. Every operation must have at least
/// one destination extent and must stay inside the larger of the two images.
pub trait DeltaProducer {
    fn produce<W: Write>(
        &self,
        old_image: &dyn ByteDevice,
        new_image: &dyn ByteDevice,
        config: &PayloadGenerationConfig,
        blob: &mut BlobFileWriter<W>,
    ) -> Result<Vec<AnnotatedOperation>>;
}

/// Block-granular diff.
///
/// Unchanged blocks are skipped, blocks whose content exists elsewhere in
/// the old image become MOVEs, and everything else is written from the blob.
/// Each old block is read by at most one MOVE and block 0 is never moved.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDiffProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPlan {
    Unchanged,
    Move(u64),
    Replace,
}

fn block_count(device: &dyn ByteDevice, block_size: BlockSize, which: &str) -> Result<u64> {
    let len = device.len_bytes();
    if !block_size.is_aligned(len) {
        return Err(IpdError::Format(format!(
            "{which} image length {len} is not a multiple of block size {block_size}"
        )));
    }
    Ok(block_size.blocks_in(len))
}

fn hash_blocks(
    device: &dyn ByteDevice,
    block_size: BlockSize,
    blocks: u64,
) -> Result<Vec<blake3::Hash>> {
    let mut buf = vec![0_u8; block_size.get() as usize];
    let mut hashes = Vec::new();
    for block in 0..blocks {
        device.read_exact_at(block << block_size.shift(), &mut buf)?;
        hashes.push(blake3::hash(&buf));
    }
    Ok(hashes)
}

impl BlockDiffProducer {
    fn plan(old_hashes: &[blake3::Hash], new_hashes: &[blake3::Hash]) -> Vec<BlockPlan> {
        let mut used = vec![false; old_hashes.len()];
        let mut plan: Vec<BlockPlan> = new_hashes
            .iter()
            .enumerate()
            .map(|(block, hash)| {
                if old_hashes.get(block) == Some(hash) {
                    used[block] = true;
                    BlockPlan::Unchanged
                } else {
                    BlockPlan::Replace
                }
            })
            .collect();

        // Block 0 is never a MOVE source.
        let mut by_hash: HashMap<blake3::Hash, VecDeque<u64>> = HashMap::new();
        for (block, hash) in (0_u64..).zip(old_hashes).skip(1) {
            by_hash.entry(*hash).or_default().push_back(block);
        }
        for (block, entry) in (0_u64..).zip(plan.iter_mut()).skip(1) {
            if *entry != BlockPlan::Replace {
                continue;
            }
            let Some(sources) = by_hash.get_mut(&new_hashes[block as usize]) else {
                continue;
            };
            while let Some(src) = sources.pop_front() {
                let slot = &mut used[src as usize];
                if !*slot {
                    *slot = true;
                    *entry = BlockPlan::Move(src);
                    break;
                }
            }
        }
        plan
    }
}

fn move_operation(
    src: u64,
    dst: u64,
    count: u64,
    block_size: BlockSize,
) -> Result<AnnotatedOperation> {
    let bytes = block_size
        .block_to_byte(count)
        .ok_or_else(|| IpdError::Format(format!("move of {count} blocks overflows")))?;
    let mut op = InstallOperation::with_extents(
        OperationType::Move,
        vec![Extent::new(src, count)],
        vec![Extent::new(dst, count)],
    );
    op.src_length = bytes;
    op.dst_length = bytes;
    Ok(AnnotatedOperation::new(format!("move {src}+{count} -> {dst}"), op))
}

impl DeltaProducer for BlockDiffProducer {
    fn produce<W: Write>(
        &self,
        old_image: &dyn ByteDevice,
        new_image: &dyn ByteDevice,
        config: &PayloadGenerationConfig,
        blob: &mut BlobFileWriter<W>,
    ) -> Result<Vec<AnnotatedOperation>> {
        let block_size = config.block_size()?;
        let chunk_blocks = config.chunk_blocks()?;
        let old_blocks = block_count(old_image, block_size, "old")?;
        let new_blocks = block_count(new_image, block_size, "new")?;
        let old_hashes = hash_blocks(old_image, block_size, old_blocks)?;
        let new_hashes = hash_blocks(new_image, block_size, new_blocks)?;
        let plan = Self::plan(&old_hashes, &new_hashes);

        let mut aops = Vec::new();
        let mut block = 0_u64;
        let (mut moved, mut replaced, mut unchanged) = (0_u64, 0_u64, 0_u64);
        while block < new_blocks {
            let start = block;
            match plan[start as usize] {
                BlockPlan::Unchanged => {
                    unchanged += 1;
                    block += 1;
                }
                BlockPlan::Move(src) => {
                    let mut count = 1;
                    while count < chunk_blocks
                        && start + count < new_blocks
                        && plan[(start + count) as usize] == BlockPlan::Move(src + count)
                    {
                        count += 1;
                    }
                    aops.push(move_operation(src, start, count, block_size)?);
                    moved += count;
                    block += count;
                }
                BlockPlan::Replace => {
                    let mut count = 1;
                    while count < chunk_blocks
                        && start + count < new_blocks
                        && plan[(start + count) as usize] == BlockPlan::Replace
                    {
                        count += 1;
                    }
                    let op = write_full_replace(
                        new_image,
                        &[Extent::new(start, count)],
                        block_size,
                        blob,
                    )?;
                    debug!(start, count, op_type = %op.op_type, "block_run_replaced");
                    aops.push(AnnotatedOperation::new(
                        format!("replace {start}+{count}"),
                        op,
                    ));
                    replaced += count;
                    block += count;
                }
            }
        }
        info!(
            old_blocks,
            new_blocks,
            unchanged,
            moved,
            replaced,
            operations = aops.len(),
            "block_diff_produced"
        );
        Ok(aops)
    }
}
