#![forbid(unsafe_code)]
//! In-place delta generation.
//!
//! Given an old and a new partition image, produce a list of block
//! operations that rewrites the old image into the new one *in place*: no
//! operation ever reads a block another operation has already overwritten.
//!
//! ## Pipeline
//!
//! 1. [`delta`]: a [`DeltaProducer`] emits raw MOVE / REPLACE operations.
//! 2. [`generator`]: operations become graph vertices, read-after-write
//!    hazards become edges.
//! 3. Cycles are broken ([`ipd_graph::CycleBreaker`]) and each cut edge is
//!    replaced by a copy through virtual temp blocks ([`cut`]).
//! 4. The graph is sorted ([`order`]) and temp blocks are mapped onto real
//!    scratch blocks, or the reader is rewritten as a full replacement when
//!    no scratch is left ([`scratch`]).

pub mod config;
pub mod cut;
pub mod delta;
pub mod generator;
pub mod order;
pub mod scratch;

pub use config::{DEFAULT_SOFT_CHUNK_SIZE, PayloadGenerationConfig};
pub use cut::{CutEdgeVertexes, MOVE_TO_SCRATCH_NAME, TempExtentAllocator, cut_edges, substitute_blocks};
pub use delta::{BlockDiffProducer, DeltaProducer};
pub use generator::{
    GenerationStats, SCRATCH_NAME, convert_graph_to_dag, create_scratch_node, generate_for_devices,
    generate_operations, generate_operations_with_stats, resolve_read_after_write_dependencies,
};
pub use order::{
    generate_reverse_topo_order_map, move_and_sort_full_ops_to_back, sort_cuts_by_topo_order,
};
pub use scratch::{
    FullOpWriter, ScratchStats, assign_block_for_adjoining_cuts, assign_temp_blocks,
    convert_cut_to_full_op, convert_cuts_to_full, no_temp_blocks_remain,
};

pub use ipd_block::{BlobFileWriter, ByteDevice, FileByteDevice, MemoryByteDevice};
pub use ipd_error::{IpdError, Result};
pub use ipd_types::{
    AnnotatedOperation, BlockSize, Extent, IN_PLACE_PAYLOAD_VERSION, InstallOperation,
    OperationType, PartitionConfig, PayloadVersion, SPARSE_HOLE, TEMP_BLOCK_START,
};

#[cfg(test)]
pub(crate) mod test_support {
    use ipd_graph::Vertex;
    use ipd_types::{AnnotatedOperation, Extent, InstallOperation, OperationType};

    pub fn ext(start_block: u64, num_blocks: u64) -> Extent {
        Extent::new(start_block, num_blocks)
    }

    /// Vertex for an operation of `op_type`, named after its destination.
    pub fn op_vertex(op_type: OperationType, src: &[Extent], dst: &[Extent]) -> Vertex {
        let name = dst
            .first()
            .map_or_else(|| format!("{op_type}"), |extent| format!("{op_type} {extent}"));
        Vertex::new(AnnotatedOperation::new(
            name,
            InstallOperation::with_extents(op_type, src.to_vec(), dst.to_vec()),
        ))
    }

    pub fn move_vertex(src: &[Extent], dst: &[Extent]) -> Vertex {
        op_vertex(OperationType::Move, src, dst)
    }
}
