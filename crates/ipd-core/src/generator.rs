//! In-place operation scheduling.
//!
//! Raw operations from a [`DeltaProducer`] are placed in a dependency graph,
//! cycles are broken by copying through temp blocks, temp blocks are mapped
//! onto real scratch space, and the operations come out in an order that is
//! safe to apply to the partition in place.

use crate::config::PayloadGenerationConfig;
use crate::cut::cut_edges;
use crate::delta::DeltaProducer;
use crate::order::{
    generate_reverse_topo_order_map, move_and_sort_full_ops_to_back, sort_cuts_by_topo_order,
};
use crate::scratch::{FullOpWriter, ScratchStats, assign_temp_blocks, no_temp_blocks_remain};
use ipd_block::{BlobFileWriter, ByteDevice, FileByteDevice};
use ipd_error::{IpdError, Result};
use ipd_graph::{
    BlockTable, CycleBreaker, Graph, VertexIndex, create_edges, dump_graph, topological_sort,
    verify_topological_order,
};
use ipd_types::{AnnotatedOperation, Extent, InstallOperation, OperationType, PartitionConfig};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{info, info_span};

/// Name of the placeholder vertex that owns the free blocks past the end of
/// the larger image. It never reaches the output.
pub const SCRATCH_NAME: &str = "<scratch>";

/// Counters describing one generation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Operations in the final list.
    pub operations: usize,
    /// Edges cut to break cycles.
    pub cuts: usize,
    /// Operations rewritten as full replacements for lack of scratch space.
    pub full_conversions: usize,
    /// Vertices never used as cycle search roots.
    pub skipped_ops: usize,
    /// Real blocks used as scratch for cut copies.
    pub scratch_blocks: u64,
    /// REPLACE / REPLACE_BZ operations in the final list.
    pub full_ops: usize,
}

/// Placeholder full operation writing the `count` blocks starting at
/// `start`, the partition space no image occupies.
#[must_use]
pub fn create_scratch_node(start: u64, count: u64) -> AnnotatedOperation {
    AnnotatedOperation::new(
        SCRATCH_NAME,
        InstallOperation::with_extents(
            OperationType::ReplaceBz,
            Vec::new(),
            vec![Extent::new(start, count)],
        ),
    )
}

/// Turn `graph` into an ordered operation list.
///
/// Breaks cycles, sorts, moves full operations to the back and resolves
/// temp blocks. `scratch` is removed from the order afterwards. Returns the
/// order over valid vertices.
pub fn convert_graph_to_dag<W: Write>(
    graph: &mut Graph,
    scratch: Option<VertexIndex>,
    writer: &mut FullOpWriter<'_, W>,
) -> Result<(Vec<VertexIndex>, GenerationStats)> {
    let mut breaker = CycleBreaker::new();
    let cut_set = breaker.break_cycles(graph)?;
    let mut cuts = cut_edges(graph, &cut_set, writer.block_size())?;

    let mut order = topological_sort(graph);
    move_and_sort_full_ops_to_back(graph, &mut order);
    let mut reverse = generate_reverse_topo_order_map(&order);
    sort_cuts_by_topo_order(&mut cuts, &reverse);

    let scratch_stats = if cuts.is_empty() {
        ScratchStats::default()
    } else {
        assign_temp_blocks(graph, &mut order, &mut reverse, &cuts, writer)?
    };

    if let Some(scratch) = scratch {
        order.retain(|&vertex| vertex != scratch);
        graph[scratch].valid = false;
    }

    dump_graph(graph);
    no_temp_blocks_remain(graph)?;
    verify_topological_order(graph, &order)?;

    let full_ops = order
        .iter()
        .filter(|&&vertex| graph[vertex].op().op_type.is_full())
        .count();
    let stats = GenerationStats {
        operations: order.len(),
        cuts: cuts.len(),
        full_conversions: scratch_stats.full_conversions,
        skipped_ops: breaker.skipped_ops(),
        scratch_blocks: scratch_stats.scratch_blocks,
        full_ops,
    };
    Ok((order, stats))
}

/// Order `aops` so that no operation reads a block after another operation
/// has overwritten it.
///
/// Sizes are in bytes. Blocks from the end of the larger image up to
/// `partition_size` are free scratch space.
pub fn resolve_read_after_write_dependencies<W: Write>(
    aops: Vec<AnnotatedOperation>,
    old_size: u64,
    new_size: u64,
    partition_size: u64,
    writer: &mut FullOpWriter<'_, W>,
) -> Result<(Vec<AnnotatedOperation>, GenerationStats)> {
    let block_size = writer.block_size();
    let table_blocks = block_size.blocks_in(old_size.max(new_size));
    let partition_blocks = block_size.blocks_in(partition_size);
    let table_len = usize::try_from(table_blocks)
        .map_err(|_| IpdError::Format(format!("{table_blocks} blocks do not fit in memory")))?;

    let mut graph = Graph::new();
    let mut table = BlockTable::new(table_len);
    for aop in aops {
        if aop.op.dst_extents.is_empty() {
            let block = aop.op.src_extents.first().map_or(0, |extent| extent.start_block);
            return Err(IpdError::malformed(
                block,
                format!("operation {} writes no blocks", aop.name),
            ));
        }
        let index = graph.add_operation(aop);
        table.add_operation(index, graph[index].op())?;
    }

    let scratch = (table_blocks < partition_blocks).then(|| {
        graph.add_operation(create_scratch_node(
            table_blocks,
            partition_blocks - table_blocks,
        ))
    });
    create_edges(&mut graph, &table);

    let (order, stats) = convert_graph_to_dag(&mut graph, scratch, writer)?;
    let ops = order.into_iter().map(|vertex| graph[vertex].aop.clone()).collect();
    info!(
        operations = stats.operations,
        cuts = stats.cuts,
        full_conversions = stats.full_conversions,
        scratch_blocks = stats.scratch_blocks,
        full_ops = stats.full_ops,
        "in_place_order_resolved"
    );
    Ok((ops, stats))
}

/// Generate in-place operations for two images already open as devices.
pub fn generate_for_devices<P: DeltaProducer, W: Write>(
    config: &PayloadGenerationConfig,
    old_image: &dyn ByteDevice,
    new_image: &dyn ByteDevice,
    producer: &P,
    blob: &mut BlobFileWriter<W>,
) -> Result<(Vec<AnnotatedOperation>, GenerationStats)> {
    config.validate()?;
    let block_size = config.block_size()?;
    let old_size = old_image.len_bytes();
    let new_size = new_image.len_bytes();
    let partition_size = config.effective_partition_size(old_size, new_size)?;

    let aops = producer.produce(old_image, new_image, config, blob)?;
    let mut writer = FullOpWriter::new(new_image, block_size, blob);
    resolve_read_after_write_dependencies(aops, old_size, new_size, partition_size, &mut writer)
}

fn open_image(part: &PartitionConfig, which: &str) -> Result<FileByteDevice> {
    let device = FileByteDevice::open_read_only(&part.path)?;
    if device.len_bytes() != part.size {
        return Err(IpdError::Format(format!(
            "{which} image {} is {} bytes, partition {} says {}",
            part.path.display(),
            device.len_bytes(),
            part.name,
            part.size
        )));
    }
    Ok(device)
}

/// [`generate_operations`] plus the run's counters.
pub fn generate_operations_with_stats<P: DeltaProducer, W: Write>(
    config: &PayloadGenerationConfig,
    old_part: &PartitionConfig,
    new_part: &PartitionConfig,
    producer: &P,
    blob: &mut BlobFileWriter<W>,
) -> Result<(Vec<AnnotatedOperation>, GenerationStats)> {
    if old_part.name != new_part.name {
        return Err(IpdError::PartitionMismatch {
            old: old_part.name.clone(),
            new: new_part.name.clone(),
        });
    }
    let _span = info_span!("generate", partition = %new_part.name).entered();
    let old_image = open_image(old_part, "old")?;
    let new_image = open_image(new_part, "new")?;
    generate_for_devices(config, &old_image, &new_image, producer, blob)
}

/// Produce the ordered in-place operation list turning `old_part` into
/// `new_part`. Full-operation payloads are appended to `blob`.
pub fn generate_operations<P: DeltaProducer, W: Write>(
    config: &PayloadGenerationConfig,
    old_part: &PartitionConfig,
    new_part: &PartitionConfig,
    producer: &P,
    blob: &mut BlobFileWriter<W>,
) -> Result<Vec<AnnotatedOperation>> {
    generate_operations_with_stats(config, old_part, new_part, producer, blob).map(|(ops, _)| ops)
}
