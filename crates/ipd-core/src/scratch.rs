//! Scratch block assignment for cut edges.
//!
//! Every cut leaves a MOVE vertex writing virtual temp blocks. This module
//! swaps those temp blocks for real blocks that some later operation is about
//! to overwrite anyway. When no such blocks are free, the reader of the temp
//! copy is rewritten as a full operation and the copy is dropped.

use crate::cut::{CutEdgeVertexes, substitute_blocks};
use crate::order::{generate_reverse_topo_order_map, position_of};
use ipd_block::{BlobFileWriter, ByteDevice, write_full_replace};
use ipd_error::{IpdError, Result};
use ipd_extent::{ExtentRanges, blocks_in_extents, temp_blocks_exist_in_extents};
use ipd_graph::{
    Graph, VertexIndex, add_read_before_dep_extents, drop_incoming_edges_to,
    drop_write_before_deps,
};
use ipd_types::{BlockSize, Extent, InstallOperation, SPARSE_HOLE, TEMP_BLOCK_START};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use tracing::{debug, info, warn};

/// Source of full-replace payloads: the new image plus the blob they go to.
pub struct FullOpWriter<'a, W: Write> {
    new_image: &'a dyn ByteDevice,
    block_size: BlockSize,
    blob: &'a mut BlobFileWriter<W>,
}

impl<'a, W: Write> FullOpWriter<'a, W> {
    pub fn new(
        new_image: &'a dyn ByteDevice,
        block_size: BlockSize,
        blob: &'a mut BlobFileWriter<W>,
    ) -> Self {
        Self {
            new_image,
            block_size,
            blob,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Full operation writing `dst_extents` with their new-image content.
    pub fn full_replace(&mut self, dst_extents: &[Extent]) -> Result<InstallOperation> {
        write_full_replace(self.new_image, dst_extents, self.block_size, self.blob)
    }
}

/// Outcome of temp block assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScratchStats {
    /// Vertices rewritten as full operations for lack of scratch space.
    pub full_conversions: usize,
    /// Real blocks handed out as scratch.
    pub scratch_blocks: u64,
}

/// Resolve the temp blocks of every cut. `cuts` must be sorted by the order
/// position of their `old_dst`; groups sharing an `old_dst` are handled
/// together, latest first.
pub fn assign_temp_blocks<W: Write>(
    graph: &mut Graph,
    order: &mut Vec<VertexIndex>,
    reverse: &mut Vec<Option<usize>>,
    cuts: &[CutEdgeVertexes],
    writer: &mut FullOpWriter<'_, W>,
) -> Result<ScratchStats> {
    let mut stats = ScratchStats::default();
    let mut end = cuts.len();
    while end > 0 {
        let old_dst = cuts[end - 1].old_dst;
        let mut start = end - 1;
        while start > 0 && cuts[start - 1].old_dst == old_dst {
            start -= 1;
        }
        let group = assign_block_for_adjoining_cuts(
            graph,
            order,
            reverse,
            &cuts[start..end],
            writer,
        )?;
        stats.full_conversions += group.full_conversions;
        stats.scratch_blocks += group.scratch_blocks;
        end = start;
    }
    info!(
        cuts = cuts.len(),
        scratch_blocks = stats.scratch_blocks,
        full_conversions = stats.full_conversions,
        "temp_blocks_assigned"
    );
    Ok(stats)
}

/// Blocks of `vertex` usable as scratch: its destination minus temp space,
/// its own sources, anything another vertex reads before it writes, and
/// block 0.
fn scratch_candidates(graph: &Graph, vertex: VertexIndex) -> ExtentRanges {
    let vertex = &graph[vertex];
    let mut ranges: ExtentRanges = vertex.op().dst_extents.iter().copied().collect();
    ranges.subtract_extent(Extent::new(TEMP_BLOCK_START, SPARSE_HOLE - TEMP_BLOCK_START));
    ranges.subtract_extents(&vertex.op().src_extents);
    for props in vertex.out_edges.values() {
        ranges.subtract_extents(&props.extents);
    }
    ranges.subtract_block(0);
    ranges
}

/// Find real scratch blocks for a group of cuts sharing one `old_dst`.
///
/// Candidates are vertices after `old_dst` in the order: they overwrite
/// their destination blocks later, so the blocks are free until then. Each
/// supplier gets a read-before edge to `old_dst` for the blocks it gives up.
pub fn assign_block_for_adjoining_cuts<W: Write>(
    graph: &mut Graph,
    order: &mut Vec<VertexIndex>,
    reverse: &mut Vec<Option<usize>>,
    cuts: &[CutEdgeVertexes],
    writer: &mut FullOpWriter<'_, W>,
) -> Result<ScratchStats> {
    let Some(first) = cuts.first() else {
        return Ok(ScratchStats::default());
    };
    let old_dst = first.old_dst;
    let blocks_needed: u64 = cuts
        .iter()
        .map(|cut| blocks_in_extents(&cut.tmp_extents))
        .sum();
    let dst_position = position_of(reverse, old_dst).ok_or_else(|| {
        IpdError::invariant(format!("cut reader {old_dst} is not in the operation order"))
    })?;

    let mut scratch_ranges = ExtentRanges::new();
    let mut suppliers: Vec<(VertexIndex, ExtentRanges)> = Vec::new();
    for &candidate in &order[dst_position + 1..] {
        if scratch_ranges.blocks() >= blocks_needed {
            break;
        }
        if !graph[candidate].valid {
            continue;
        }
        let mut ranges = scratch_candidates(graph, candidate);
        if ranges.is_empty() {
            continue;
        }
        let still_needed = blocks_needed - scratch_ranges.blocks();
        if ranges.blocks() > still_needed {
            ranges = ranges
                .extents_for_block_count(still_needed)
                .unwrap_or_default()
                .into_iter()
                .collect();
        }
        scratch_ranges.add_ranges(&ranges);
        suppliers.push((candidate, ranges));
    }

    if scratch_ranges.blocks() < blocks_needed {
        warn!(
            old_dst,
            name = graph[old_dst].name(),
            blocks_needed,
            blocks_found = scratch_ranges.blocks(),
            "temp_blocks_insufficient_scratch"
        );
        let full_conversions = convert_cuts_to_full(graph, order, reverse, cuts, writer)?;
        return Ok(ScratchStats {
            full_conversions,
            scratch_blocks: 0,
        });
    }

    for (supplier, ranges) in &suppliers {
        add_read_before_dep_extents(&mut graph[*supplier], old_dst, &ranges.extent_set());
    }
    for cut in cuts {
        let need = blocks_in_extents(&cut.tmp_extents);
        let real = scratch_ranges.extents_for_block_count(need).ok_or_else(|| {
            IpdError::invariant(format!(
                "scratch for cut {} -> {} shrank below {need} blocks",
                cut.old_src, cut.old_dst
            ))
        })?;
        scratch_ranges.subtract_extents(&real);
        substitute_blocks(&mut graph[old_dst], &cut.tmp_extents, &real)?;
        debug!(new_vertex = cut.new_vertex, old_dst, blocks = need, "scratch_assigned");
        graph[cut.new_vertex].op_mut().dst_extents = real;
    }
    Ok(ScratchStats {
        full_conversions: 0,
        scratch_blocks: blocks_needed,
    })
}

/// Convert every cut in a group to full. The shared `old_dst` moves to the
/// end of the order; the copy vertices leave it. Returns the number of
/// vertices rewritten.
pub fn convert_cuts_to_full<W: Write>(
    graph: &mut Graph,
    order: &mut Vec<VertexIndex>,
    reverse: &mut Vec<Option<usize>>,
    cuts: &[CutEdgeVertexes],
    writer: &mut FullOpWriter<'_, W>,
) -> Result<usize> {
    let Some(first) = cuts.first() else {
        return Ok(0);
    };
    let old_dst = first.old_dst;
    let mut converted = 0;
    let mut deleted = BTreeSet::from([old_dst]);
    for cut in cuts {
        if convert_cut_to_full_op(graph, cut, writer)? {
            converted += 1;
        }
        deleted.insert(cut.new_vertex);
    }
    order.retain(|vertex| !deleted.contains(vertex));
    order.push(old_dst);
    *reverse = generate_reverse_topo_order_map(order);
    Ok(converted)
}

/// Undo one cut by rewriting its reader as a full operation.
///
/// The reader keeps its name and read-before out-edges, loses its
/// write-before edges and every incoming edge. The copy vertex is
/// invalidated. Returns whether the reader was rewritten (it may already be
/// full from an earlier cut in its group).
pub fn convert_cut_to_full_op<W: Write>(
    graph: &mut Graph,
    cut: &CutEdgeVertexes,
    writer: &mut FullOpWriter<'_, W>,
) -> Result<bool> {
    let old_dst = cut.old_dst;
    let mut converted = false;
    if !graph[old_dst].op().op_type.is_full() {
        let mut out_edges = graph[old_dst].out_edges.clone();
        drop_write_before_deps(&mut out_edges);
        let dst_extents = graph[old_dst].op().dst_extents.clone();
        let op = writer.full_replace(&dst_extents)?;
        debug!(
            old_dst,
            name = graph[old_dst].name(),
            op_type = %op.op_type,
            "cut_reader_converted_to_full"
        );
        *graph[old_dst].op_mut() = op;
        graph[old_dst].out_edges = out_edges;
        drop_incoming_edges_to(graph, old_dst);
        converted = true;
    }
    graph[cut.old_src].out_edges.remove(&cut.new_vertex);
    graph[cut.new_vertex].valid = false;
    if graph.has_edge((old_dst, cut.new_vertex)) {
        return Err(IpdError::invariant(format!(
            "full operation {old_dst} still depends on dropped copy {}",
            cut.new_vertex
        )));
    }
    Ok(converted)
}

/// Fail if any valid vertex still references virtual temp blocks, in its
/// operation or on its out-edges.
pub fn no_temp_blocks_remain(graph: &Graph) -> Result<()> {
    for (index, vertex) in graph.iter().enumerate() {
        if !vertex.valid {
            continue;
        }
        let op = vertex.op();
        let in_op = temp_blocks_exist_in_extents(&op.src_extents)
            || temp_blocks_exist_in_extents(&op.dst_extents);
        let on_edge = vertex.out_edges.values().any(|props| {
            temp_blocks_exist_in_extents(&props.extents)
                || temp_blocks_exist_in_extents(&props.write_extents)
        });
        if in_op || on_edge {
            return Err(IpdError::invariant(format!(
                "vertex {index} ({}) still references temp blocks",
                vertex.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ext, move_vertex, op_vertex};
    use ipd_block::MemoryByteDevice;
    use ipd_graph::{EdgeProperties, verify_topological_order};
    use ipd_types::OperationType;

    const BS: u64 = 4096;

    fn cut(new_vertex: usize, old_src: usize, old_dst: usize, tmp: Vec<Extent>) -> CutEdgeVertexes {
        CutEdgeVertexes {
            new_vertex,
            old_src,
            old_dst,
            tmp_extents: tmp,
        }
    }

    fn read(extents: Vec<Extent>) -> EdgeProperties {
        EdgeProperties::read_before(extents)
    }

    fn write(extents: Vec<Extent>) -> EdgeProperties {
        EdgeProperties::write_before(extents)
    }

    #[test]
    fn reuses_later_blocks_and_converts_when_short() {
        let tmp = TEMP_BLOCK_START;
        let mut graph: Graph = vec![
            move_vertex(&[ext(0, 1)], &[ext(1, 1)]),
            move_vertex(&[ext(tmp, 1)], &[ext(0, 1)]),
            move_vertex(&[ext(1, 1)], &[ext(tmp, 1)]),
            move_vertex(&[ext(4, 2)], &[ext(2, 2)]),
            move_vertex(&[ext(6, 1)], &[ext(7, 1)]),
            move_vertex(&[ext(tmp + 1, 3)], &[ext(4, 3)]),
            move_vertex(&[ext(2, 2)], &[ext(tmp + 1, 2)]),
            move_vertex(&[ext(7, 1)], &[ext(tmp + 3, 1)]),
            op_vertex(OperationType::Replace, &[], &[ext(8, 1)]),
        ]
        .into_iter()
        .collect();
        graph[0].out_edges.insert(2, read(vec![ext(1, 1)]));
        graph[1].out_edges.insert(2, write(vec![ext(tmp, 1)]));
        graph[1].out_edges.insert(0, read(vec![ext(0, 1)]));
        graph[3].out_edges.insert(6, read(vec![ext(2, 2)]));
        graph[4].out_edges.insert(7, read(vec![ext(7, 1)]));
        graph[5].out_edges.insert(6, write(vec![ext(tmp + 1, 2)]));
        graph[5].out_edges.insert(7, write(vec![ext(tmp + 3, 1)]));
        graph[5].out_edges.insert(3, read(vec![ext(4, 2)]));
        graph[5].out_edges.insert(4, read(vec![ext(6, 1)]));

        let cuts = vec![
            cut(2, 0, 1, vec![ext(tmp, 1)]),
            cut(6, 3, 5, vec![ext(tmp + 1, 2)]),
            cut(7, 4, 5, vec![ext(tmp + 3, 1)]),
        ];
        let mut order = vec![2, 0, 1, 6, 3, 7, 4, 5, 8];
        let mut reverse = generate_reverse_topo_order_map(&order);

        let image = MemoryByteDevice::zeroed(9 * BS as usize);
        let mut blob = BlobFileWriter::in_memory();
        let bs = BlockSize::new(BS).expect("bs");
        let mut writer = FullOpWriter::new(&image, bs, &mut blob);
        let stats = assign_temp_blocks(&mut graph, &mut order, &mut reverse, &cuts, &mut writer)
            .expect("assign");

        assert_eq!(stats.full_conversions, 1);
        assert_eq!(stats.scratch_blocks, 1);
        assert!(!graph[6].valid);
        assert!(!graph[7].valid);
        assert_eq!(graph[5].op().op_type, OperationType::ReplaceBz);
        assert!(graph[5].op().src_extents.is_empty());
        assert_eq!(graph[5].out_edges.keys().copied().collect::<Vec<_>>(), vec![3, 4]);

        assert_eq!(graph[1].op().src_extents, vec![ext(2, 1)]);
        assert_eq!(graph[2].op().dst_extents, vec![ext(2, 1)]);
        assert_eq!(graph[1].out_edges[&2].write_extents, vec![ext(2, 1)]);
        assert_eq!(graph[3].out_edges[&1].extents, vec![ext(2, 1)]);

        assert_eq!(order, vec![2, 0, 1, 3, 4, 8, 5]);
        assert_eq!(reverse, generate_reverse_topo_order_map(&order));
        no_temp_blocks_remain(&graph).expect("no temp blocks");
        verify_topological_order(&graph, &order).expect("order");
    }

    #[test]
    fn suppliers_never_give_up_block_zero_or_read_blocks() {
        let mut graph: Graph = vec![
            move_vertex(&[ext(TEMP_BLOCK_START, 2)], &[ext(9, 2)]),
            op_vertex(OperationType::Replace, &[], &[ext(0, 4)]),
            move_vertex(&[ext(10, 1)], &[ext(12, 2)]),
        ]
        .into_iter()
        .collect();
        // Someone reads block 1 before vertex 1 writes it.
        graph[1].out_edges.insert(2, read(vec![ext(1, 1)]));
        let mut order = vec![0, 1, 2];
        let mut reverse = generate_reverse_topo_order_map(&order);
        let cuts = vec![cut(2, 2, 0, vec![ext(TEMP_BLOCK_START, 2)])];

        let image = MemoryByteDevice::zeroed(16 * BS as usize);
        let mut blob = BlobFileWriter::in_memory();
        let mut writer = FullOpWriter::new(&image, BlockSize::new(BS).expect("bs"), &mut blob);
        let stats =
            assign_block_for_adjoining_cuts(&mut graph, &mut order, &mut reverse, &cuts, &mut writer)
                .expect("assign");
        assert_eq!(stats.scratch_blocks, 2);
        assert_eq!(graph[0].op().src_extents, vec![ext(2, 2)]);
        assert_eq!(graph[1].out_edges[&0].extents, vec![ext(2, 2)]);
    }

    #[test]
    fn convert_keeps_name_and_read_before_edges() {
        let mut graph: Graph = vec![
            move_vertex(&[ext(5, 1)], &[ext(6, 1)]),
            move_vertex(&[ext(TEMP_BLOCK_START, 1)], &[ext(5, 1)]),
            move_vertex(&[ext(6, 1)], &[ext(TEMP_BLOCK_START, 1)]),
            op_vertex(OperationType::Replace, &[], &[ext(7, 1)]),
        ]
        .into_iter()
        .collect();
        graph[0].out_edges.insert(2, read(vec![ext(6, 1)]));
        graph[1].out_edges.insert(2, write(vec![ext(TEMP_BLOCK_START, 1)]));
        graph[1].out_edges.insert(0, read(vec![ext(5, 1)]));
        graph[3].out_edges.insert(1, read(vec![ext(7, 1)]));
        let name = graph[1].name().to_owned();

        let image = MemoryByteDevice::zeroed(8 * BS as usize);
        let mut blob = BlobFileWriter::in_memory();
        let mut writer = FullOpWriter::new(&image, BlockSize::new(BS).expect("bs"), &mut blob);
        let converted = convert_cut_to_full_op(
            &mut graph,
            &cut(2, 0, 1, vec![ext(TEMP_BLOCK_START, 1)]),
            &mut writer,
        )
        .expect("convert");
        assert!(converted);
        assert_eq!(graph[1].name(), name);
        assert!(graph[1].op().op_type.is_full());
        assert_eq!(graph[1].op().dst_extents, vec![ext(5, 1)]);
        assert_eq!(graph[1].out_edges.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert!(!graph.has_edge((3, 1)));
        assert!(!graph.has_edge((0, 2)));
        assert!(!graph[2].valid);
        assert!(blob.total() > 0);
    }

    #[test]
    fn leftover_temp_blocks_are_reported() {
        let mut graph: Graph = vec![
            move_vertex(&[ext(1, 1)], &[ext(2, 1)]),
            move_vertex(&[ext(3, 1)], &[ext(TEMP_BLOCK_START + 4, 1)]),
        ]
        .into_iter()
        .collect();
        let err = no_temp_blocks_remain(&graph).expect_err("temp in dst");
        assert!(err.is_internal());

        graph[1].valid = false;
        no_temp_blocks_remain(&graph).expect("invalid vertices ignored");

        graph[0]
            .out_edges
            .insert(1, write(vec![ext(TEMP_BLOCK_START, 1)]));
        assert!(no_temp_blocks_remain(&graph).is_err());
    }
}
