//! Edge cutting: replace a cyclic dependency with a copy to temp space.
//!
//! Cutting edge `src -> dst` (dst reads blocks `E` that src overwrites)
//! inserts a MOVE vertex copying `E` to fresh virtual temp blocks, points
//! `dst` at the temp copy, and orders the copy before both `src` and `dst`.
//! Temp blocks are resolved to real scratch blocks later.

use ipd_error::{IpdError, Result};
use ipd_extent::{compress_extents, expand_extents};
use ipd_graph::{Edge, EdgeProperties, Graph, Vertex, VertexIndex, edge_weight};
use ipd_types::{
    AnnotatedOperation, BlockSize, Extent, InstallOperation, OperationType, SPARSE_HOLE,
    TEMP_BLOCK_START,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Name given to the MOVE vertices created by cutting.
pub const MOVE_TO_SCRATCH_NAME: &str = "<move-to-scratch>";

/// Hands out virtual temp extents in increasing order, never reusing an
/// address within one run.
#[derive(Debug, Clone)]
pub struct TempExtentAllocator {
    next: u64,
}

impl Default for TempExtentAllocator {
    fn default() -> Self {
        Self {
            next: TEMP_BLOCK_START,
        }
    }
}

impl TempExtentAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous temp blocks.
    pub fn allocate(&mut self, count: u64) -> Result<Vec<Extent>> {
        let end = self
            .next
            .checked_add(count)
            .filter(|&end| end < SPARSE_HOLE)
            .ok_or_else(|| IpdError::invariant("temp block address space exhausted"))?;
        let extent = Extent::new(self.next, count);
        self.next = end;
        Ok(if count == 0 { Vec::new() } else { vec![extent] })
    }
}

/// Record of one cut edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutEdgeVertexes {
    /// The MOVE-to-temp vertex created for the cut.
    pub new_vertex: VertexIndex,
    /// Writer side of the cut edge.
    pub old_src: VertexIndex,
    /// Reader side of the cut edge; now reads `tmp_extents`.
    pub old_dst: VertexIndex,
    pub tmp_extents: Vec<Extent>,
}

/// Rewrite the blocks `vertex` reads: block `i` of `remove_extents` becomes
/// block `i` of `replace_extents`, in its source extents and in the
/// write-before extents of its out-edges. Read order and block count are
/// preserved.
pub fn substitute_blocks(
    vertex: &mut Vertex,
    remove_extents: &[Extent],
    replace_extents: &[Extent],
) -> Result<()> {
    let remove = expand_extents(remove_extents);
    let replace = expand_extents(replace_extents);
    if remove.len() != replace.len() {
        return Err(IpdError::invariant(format!(
            "substituting {} blocks with {} blocks in {}",
            remove.len(),
            replace.len(),
            vertex.name()
        )));
    }
    let conversion: HashMap<u64, u64> = remove
        .into_iter()
        .zip(replace)
        .filter(|&(old, _)| old != SPARSE_HOLE)
        .collect();
    let apply = |extents: &[Extent]| -> Vec<Extent> {
        let blocks: Vec<u64> = expand_extents(extents)
            .into_iter()
            .map(|block| conversion.get(&block).copied().unwrap_or(block))
            .collect();
        compress_extents(&blocks)
    };

    let src = apply(&vertex.op().src_extents);
    vertex.op_mut().src_extents = src;
    for props in vertex.out_edges.values_mut() {
        props.write_extents = apply(&props.write_extents);
    }
    Ok(())
}

/// Cut every edge in `edges`, returning one record per cut in edge order.
pub fn cut_edges(
    graph: &mut Graph,
    edges: &BTreeSet<Edge>,
    block_size: BlockSize,
) -> Result<Vec<CutEdgeVertexes>> {
    let mut allocator = TempExtentAllocator::new();
    let mut cuts = Vec::with_capacity(edges.len());
    let mut temp_blocks = 0_u64;

    for &(old_src, old_dst) in edges {
        let props = graph.edge((old_src, old_dst)).cloned().ok_or_else(|| {
            IpdError::invariant(format!("cut edge {old_src} -> {old_dst} is not in the graph"))
        })?;
        if !props.write_extents.is_empty() {
            return Err(IpdError::invariant(format!(
                "cannot cut edge {old_src} -> {old_dst} with a write-before dependency"
            )));
        }
        let weight = edge_weight(graph, (old_src, old_dst));
        let tmp_extents = allocator.allocate(weight)?;
        temp_blocks += weight;

        let bytes = block_size.block_to_byte(weight).ok_or_else(|| {
            IpdError::invariant(format!("cut of {weight} blocks overflows byte length"))
        })?;
        let mut op = InstallOperation::with_extents(
            OperationType::Move,
            props.extents.clone(),
            tmp_extents.clone(),
        );
        op.src_length = bytes;
        op.dst_length = bytes;
        let new_vertex = graph.add_operation(AnnotatedOperation::new(MOVE_TO_SCRATCH_NAME, op));

        // src now waits on the copy instead of on dst.
        graph[old_src].out_edges.insert(new_vertex, props.clone());
        substitute_blocks(&mut graph[old_dst], &props.extents, &tmp_extents)?;
        graph.remove_edge((old_src, old_dst));
        // The copy must land before dst reads it.
        graph[old_dst]
            .out_edges
            .insert(new_vertex, EdgeProperties::write_before(tmp_extents.clone()));

        debug!(old_src, old_dst, new_vertex, weight, "edge_cut");
        cuts.push(CutEdgeVertexes {
            new_vertex,
            old_src,
            old_dst,
            tmp_extents,
        });
    }
    info!(cuts = cuts.len(), temp_blocks, "edges_cut");
    Ok(cuts)
}
