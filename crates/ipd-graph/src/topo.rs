//! DFS topological order.
//!
//! A vertex is emitted after every vertex it points at, so for an edge
//! `A -> B` (B before A) B appears first. Roots are taken in index order and
//! successors in edge-map order, which makes the result deterministic.

use crate::{Graph, VertexIndex};
use ipd_error::{IpdError, Result};
use tracing::debug;

/// Post-order DFS over valid vertices. Tombstoned vertices and edges into
/// them are skipped. On a cyclic graph the back edge is ignored and the
/// order is still a permutation of the valid vertices.
#[must_use]
pub fn topological_sort(graph: &Graph) -> Vec<VertexIndex> {
    let mut visited = vec![false; graph.len()];
    let mut order = Vec::with_capacity(graph.len());
    // (vertex, successors, next successor)
    let mut frames: Vec<(VertexIndex, Vec<VertexIndex>, usize)> = Vec::new();

    for root in 0..graph.len() {
        if visited[root] || !graph[root].valid {
            continue;
        }
        visited[root] = true;
        frames.push((root, successors(graph, root), 0));

        while let Some((vertex, succ, next)) = frames.last_mut() {
            if let Some(&w) = succ.get(*next) {
                *next += 1;
                if !visited[w] {
                    visited[w] = true;
                    frames.push((w, successors(graph, w), 0));
                }
                continue;
            }
            order.push(*vertex);
            frames.pop();
        }
    }
    debug!(vertices = order.len(), "topological_sort_done");
    order
}

fn successors(graph: &Graph, vertex: VertexIndex) -> Vec<VertexIndex> {
    graph[vertex]
        .out_edges
        .keys()
        .copied()
        .filter(|&w| graph.get(w).is_some_and(|target| target.valid))
        .collect()
}

/// Check that every edge between valid vertices points at a vertex placed
/// earlier in `order`, and that `order` lists each valid vertex once.
pub fn verify_topological_order(graph: &Graph, order: &[VertexIndex]) -> Result<()> {
    let mut position = vec![None; graph.len()];
    for (pos, &vertex) in order.iter().enumerate() {
        let Some(slot) = position.get_mut(vertex) else {
            return Err(IpdError::invariant(format!(
                "order names vertex {vertex} outside the graph"
            )));
        };
        if slot.is_some() {
            return Err(IpdError::invariant(format!(
                "vertex {vertex} appears twice in the order"
            )));
        }
        *slot = Some(pos);
    }
    for (src, vertex) in graph.iter().enumerate() {
        if !vertex.valid {
            continue;
        }
        let Some(src_pos) = position[src] else {
            return Err(IpdError::invariant(format!(
                "valid vertex {src} missing from the order"
            )));
        };
        for &dst in vertex.out_edges.keys() {
            if !graph.get(dst).is_some_and(|target| target.valid) {
                continue;
            }
            match position[dst] {
                Some(dst_pos) if dst_pos < src_pos => {}
                _ => {
                    return Err(IpdError::invariant(format!(
                        "edge {src} -> {dst} contradicts the order"
                    )));
                }
            }
        }
    }
    Ok(())
}
