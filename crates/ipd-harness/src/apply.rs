//! In-place payload applier.
//!
//! Replays an ordered operation list on a mutable partition image exactly as
//! an updater would: strictly in order, reading and writing the same device.

use anyhow::{Context, Result, bail};
use ipd_block::{ByteDevice, decompress_bzip2, read_extents, write_extents};
use ipd_extent::{blocks_in_extents, temp_blocks_exist_in_extents};
use ipd_types::{AnnotatedOperation, BlockSize, OperationType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub operations: usize,
    pub moved_blocks: u64,
    pub replaced_blocks: u64,
    pub blob_bytes_read: u64,
}

fn blob_slice<'a>(blob: &'a [u8], aop: &AnnotatedOperation) -> Result<&'a [u8]> {
    let start = usize::try_from(aop.op.data_offset).context("data_offset overflows usize")?;
    let len = usize::try_from(aop.op.data_length).context("data_length overflows usize")?;
    start
        .checked_add(len)
        .and_then(|end| blob.get(start..end))
        .with_context(|| {
            format!(
                "operation {} points past the blob ({}+{} of {} bytes)",
                aop.name,
                start,
                len,
                blob.len()
            )
        })
}

/// Apply `ops` in order to `device`. Full operations take their data from
/// `blob`.
pub fn apply_operations(
    device: &dyn ByteDevice,
    ops: &[AnnotatedOperation],
    blob: &[u8],
    block_size: BlockSize,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();
    for (index, aop) in ops.iter().enumerate() {
        let op = &aop.op;
        let dst_blocks = blocks_in_extents(&op.dst_extents);
        let dst_bytes = usize::try_from(dst_blocks << block_size.shift())
            .context("destination size overflows usize")?;
        match op.op_type {
            OperationType::Move => {
                // All reads land before any write.
                let data = read_extents(device, &op.src_extents, block_size)
                    .with_context(|| format!("operation {index} ({}) read", aop.name))?;
                if data.len() != dst_bytes {
                    bail!(
                        "operation {index} ({}) reads {} bytes but writes {dst_bytes}",
                        aop.name,
                        data.len()
                    );
                }
                write_extents(device, &op.dst_extents, block_size, &data)
                    .with_context(|| format!("operation {index} ({}) write", aop.name))?;
                report.moved_blocks += dst_blocks;
            }
            OperationType::Replace => {
                let payload = blob_slice(blob, aop)?;
                write_extents(device, &op.dst_extents, block_size, payload)
                    .with_context(|| format!("operation {index} ({}) write", aop.name))?;
                report.replaced_blocks += dst_blocks;
                report.blob_bytes_read += op.data_length;
            }
            OperationType::ReplaceBz => {
                let payload = decompress_bzip2(blob_slice(blob, aop)?, dst_bytes)
                    .with_context(|| format!("operation {index} ({}) payload", aop.name))?;
                write_extents(device, &op.dst_extents, block_size, &payload)
                    .with_context(|| format!("operation {index} ({}) write", aop.name))?;
                report.replaced_blocks += dst_blocks;
                report.blob_bytes_read += op.data_length;
            }
            OperationType::Bsdiff => {
                bail!("operation {index} ({}) is BSDIFF, which has no codec here", aop.name);
            }
        }
        debug!(index, name = %aop.name, op_type = %op.op_type, dst_blocks, "operation_applied");
        report.operations += 1;
    }
    device.sync()?;
    info!(
        operations = report.operations,
        moved_blocks = report.moved_blocks,
        replaced_blocks = report.replaced_blocks,
        "payload_applied"
    );
    Ok(report)
}

/// Structural checks on a generated list: no temp blocks, MOVEs never touch
/// block 0, and every destination fits in `partition_blocks`.
pub fn check_operations(ops: &[AnnotatedOperation], partition_blocks: u64) -> Result<()> {
    for (index, aop) in ops.iter().enumerate() {
        let op = &aop.op;
        if temp_blocks_exist_in_extents(&op.src_extents)
            || temp_blocks_exist_in_extents(&op.dst_extents)
        {
            bail!("operation {index} ({}) references temp blocks", aop.name);
        }
        if op.op_type == OperationType::Move
            && op
                .src_extents
                .iter()
                .chain(&op.dst_extents)
                .any(|extent| extent.start_block == 0)
        {
            bail!("MOVE operation {index} ({}) touches block 0", aop.name);
        }
        if let Some(extent) = op
            .dst_extents
            .iter()
            .find(|extent| extent.is_sparse_hole() || extent.end() > partition_blocks)
        {
            bail!(
                "operation {index} ({}) writes {extent} outside {partition_blocks} blocks",
                aop.name
            );
        }
    }
    Ok(())
}
