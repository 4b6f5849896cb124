//! Block ownership table and read-after-write edge creation.
//!
//! Every operation is registered as the writer of its destination blocks and
//! the reader of its source blocks. A block with a reader and a different
//! writer becomes one block of read-before extents on the edge
//! `writer -> reader`.

use crate::{Graph, VertexIndex, add_read_before_dep};
use ipd_error::{IpdError, Result};
use ipd_types::{Extent, InstallOperation};
use tracing::{info, trace};

/// Reader and writer of one physical block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOwner {
    /// Last operation registered as reading the block.
    pub reader: Option<VertexIndex>,
    /// The only operation allowed to write the block.
    pub writer: Option<VertexIndex>,
}

/// Dense per-block ownership table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    blocks: Vec<BlockOwner>,
}

impl BlockTable {
    /// Table covering blocks `0..block_count`.
    #[must_use]
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: vec![BlockOwner::default(); block_count],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn get(&self, block: u64) -> Option<&BlockOwner> {
        usize::try_from(block)
            .ok()
            .and_then(|index| self.blocks.get(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockOwner> {
        self.blocks.iter()
    }

    /// Register `op` (vertex `vertex`) as reader of its source blocks and
    /// writer of its destination blocks.
    ///
    /// Multiple readers of a block are allowed; the last one wins. A second
    /// writer of a block is malformed input. Sparse-hole extents name no
    /// block and are skipped.
    pub fn add_operation(&mut self, vertex: VertexIndex, op: &InstallOperation) -> Result<()> {
        for &extent in &op.src_extents {
            for slot in self.slots(extent)? {
                slot.reader = Some(vertex);
            }
        }
        for &extent in &op.dst_extents {
            let start = extent.start_block;
            for (offset, slot) in (0_u64..).zip(self.slots(extent)?) {
                match slot.writer {
                    Some(existing) if existing != vertex => {
                        return Err(IpdError::malformed(
                            start + offset,
                            format!("block written by operations {existing} and {vertex}"),
                        ));
                    }
                    _ => slot.writer = Some(vertex),
                }
            }
        }
        trace!(
            vertex,
            src_extents = op.src_extents.len(),
            dst_extents = op.dst_extents.len(),
            "block_table_register"
        );
        Ok(())
    }

    /// Mutable slots for the blocks of `extent`, or malformed input if the
    /// extent runs past the table.
    fn slots(&mut self, extent: Extent) -> Result<std::slice::IterMut<'_, BlockOwner>> {
        if extent.is_sparse_hole() || extent.num_blocks == 0 {
            return Ok(self.blocks[..0].iter_mut());
        }
        let table_len = self.blocks.len();
        let out_of_range = || {
            IpdError::malformed(
                extent.start_block,
                format!("extent {extent} runs past the {table_len}-block table"),
            )
        };
        let end = extent.checked_end().ok_or_else(out_of_range)?;
        let start = usize::try_from(extent.start_block).map_err(|_| out_of_range())?;
        let end = usize::try_from(end).map_err(|_| out_of_range())?;
        if end > table_len {
            return Err(out_of_range());
        }
        Ok(self.blocks[start..end].iter_mut())
    }
}

/// Add a read-before edge `writer -> reader` for every block whose reader
/// and writer differ. Returns the number of blocks that produced a
/// dependency.
pub fn create_edges(graph: &mut Graph, table: &BlockTable) -> u64 {
    let mut dependent_blocks = 0_u64;
    for (block, owner) in (0_u64..).zip(table.iter()) {
        let (Some(reader), Some(writer)) = (owner.reader, owner.writer) else {
            continue;
        };
        if reader == writer {
            continue;
        }
        add_read_before_dep(&mut graph[writer], reader, block);
        dependent_blocks += 1;
    }
    let edges: usize = graph.iter().map(|vertex| vertex.out_edges.len()).sum();
    info!(dependent_blocks, edges, "graph_edges_created");
    dependent_blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::vertex;
    use ipd_types::OperationType;

    fn build(vertices: Vec<crate::Vertex>, block_count: usize) -> Result<Graph> {
        let mut graph: Graph = vertices.into_iter().collect();
        let mut table = BlockTable::new(block_count);
        for index in 0..graph.len() {
            table.add_operation(index, graph[index].op())?;
        }
        create_edges(&mut graph, &table);
        Ok(graph)
    }

    #[test]
    fn writer_points_at_reader() {
        // 0 copies 0..2 to 4..6; 1 copies 4..6 to 8..10. 1 must run first.
        let graph = build(
            vec![
                vertex("a", OperationType::Move, &[(0, 2)], &[(4, 2)]),
                vertex("b", OperationType::Move, &[(4, 2)], &[(8, 2)]),
            ],
            16,
        )
        .expect("build");
        assert_eq!(graph.edges(), vec![(0, 1)]);
        assert_eq!(graph[0].out_edges[&1].extents, vec![Extent::new(4, 2)]);
        assert!(graph[0].out_edges[&1].write_extents.is_empty());
    }

    #[test]
    fn swap_creates_two_cycle() {
        let graph = build(
            vec![
                vertex("a", OperationType::Move, &[(0, 3)], &[(3, 3)]),
                vertex("b", OperationType::Move, &[(3, 1)], &[(0, 1)]),
            ],
            8,
        )
        .expect("build");
        assert_eq!(graph.edges(), vec![(0, 1), (1, 0)]);
        assert_eq!(graph[0].out_edges[&1].extents, vec![Extent::new(3, 1)]);
        assert_eq!(graph[1].out_edges[&0].extents, vec![Extent::new(0, 1)]);
    }

    #[test]
    fn self_read_write_adds_no_edge() {
        let graph = build(
            vec![vertex("a", OperationType::Bsdiff, &[(0, 4)], &[(0, 4)])],
            4,
        )
        .expect("build");
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn last_reader_wins() {
        let graph = build(
            vec![
                vertex("w", OperationType::Replace, &[], &[(2, 1)]),
                vertex("r1", OperationType::Move, &[(2, 1)], &[(5, 1)]),
                vertex("r2", OperationType::Move, &[(2, 1)], &[(6, 1)]),
            ],
            8,
        )
        .expect("build");
        assert_eq!(graph.edges(), vec![(0, 2)]);
    }

    #[test]
    fn second_writer_is_malformed() {
        let err = build(
            vec![
                vertex("a", OperationType::Replace, &[], &[(0, 4)]),
                vertex("b", OperationType::Replace, &[], &[(3, 2)]),
            ],
            8,
        )
        .expect_err("double write");
        assert!(matches!(err, IpdError::MalformedInput { block: 3, .. }));
        assert!(!err.is_internal());
    }

    #[test]
    fn extent_past_table_is_malformed() {
        let err = build(
            vec![vertex("a", OperationType::Move, &[(6, 4)], &[(0, 4)])],
            8,
        )
        .expect_err("out of range");
        assert!(matches!(err, IpdError::MalformedInput { block: 6, .. }));
    }

    #[test]
    fn sparse_holes_are_not_registered() {
        let mut table = BlockTable::new(4);
        let op = InstallOperation::with_extents(
            OperationType::Move,
            vec![Extent::sparse_hole(3), Extent::new(1, 1)],
            vec![Extent::new(2, 1)],
        );
        table.add_operation(0, &op).expect("register");
        assert_eq!(table.get(1).and_then(|o| o.reader), Some(0));
        assert_eq!(table.get(2).and_then(|o| o.writer), Some(0));
        assert_eq!(table.iter().filter(|o| o.reader.is_some()).count(), 1);
        assert!(table.get(4).is_none());
    }
}
