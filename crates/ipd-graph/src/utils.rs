//! Edge helpers shared by the builder, the cutter and the scratch allocator.

use crate::{Edge, EdgeProperties, Graph, Vertex, VertexIndex};
use ipd_extent::{
    append_block_to_extents, expand_extents, extents_to_string, real_blocks_in_extents,
};
use ipd_types::Extent;
use std::collections::BTreeMap;
use tracing::{Level, debug, enabled};

/// Number of real blocks on the read-before side of `edge`. Missing edges
/// weigh nothing.
#[must_use]
pub fn edge_weight(graph: &Graph, edge: Edge) -> u64 {
    graph
        .edge(edge)
        .map_or(0, |props| real_blocks_in_extents(&props.extents))
}

/// Record that `dst` reads `block` before `vertex` overwrites it, creating
/// the edge `vertex -> dst` if needed.
pub fn add_read_before_dep(vertex: &mut Vertex, dst: VertexIndex, block: u64) {
    let props = vertex.out_edges.entry(dst).or_default();
    append_block_to_extents(&mut props.extents, block);
}

/// [`add_read_before_dep`] for every block of `extents`, in order. No edge
/// is created for an empty list.
pub fn add_read_before_dep_extents(vertex: &mut Vertex, dst: VertexIndex, extents: &[Extent]) {
    for block in expand_extents(extents) {
        add_read_before_dep(vertex, dst, block);
    }
}

/// Clear every write-before set and drop edges left without read-before
/// blocks.
pub fn drop_write_before_deps(edges: &mut BTreeMap<VertexIndex, EdgeProperties>) {
    edges.retain(|_, props| {
        props.write_extents.clear();
        !props.extents.is_empty()
    });
}

/// Remove every edge pointing at `index`.
pub fn drop_incoming_edges_to(graph: &mut Graph, index: VertexIndex) {
    for vertex in graph.iter_mut() {
        vertex.out_edges.remove(&index);
    }
}

/// Log every vertex, its operation and its edges at debug level.
pub fn dump_graph(graph: &Graph) {
    if !enabled!(Level::DEBUG) {
        return;
    }
    debug!(vertices = graph.len(), "graph_dump_begin");
    for (index, vertex) in graph.iter().enumerate() {
        debug!(
            index,
            valid = vertex.valid,
            name = vertex.name(),
            op_type = %vertex.op().op_type,
            src = %extents_to_string(&vertex.op().src_extents),
            dst = %extents_to_string(&vertex.op().dst_extents),
            "graph_vertex"
        );
        for (dst, props) in &vertex.out_edges {
            debug!(
                src = index,
                dst,
                read_before = %extents_to_string(&props.extents),
                write_before = %extents_to_string(&props.write_extents),
                "graph_edge"
            );
        }
    }
}
