#![forbid(unsafe_code)]
//! Operation dependency graph for in-place payloads.
//!
//! One vertex per install operation, stored in an arena whose indices never
//! change for the lifetime of a generation run. Deleting a vertex tombstones
//! it (`valid = false`); cut records and edges keep referring to vertices by
//! index.
//!
//! ## Edge direction
//!
//! An edge `A -> B` means **B must run before A**. Edges are created from the
//! writer of a block to its reader: the reader has to consume the old content
//! before the writer overwrites it.
//!
//! ## Layers
//!
//! 1. [`builder`]: block ownership table and edge creation.
//! 2. [`tarjan`]: strongly connected component containing a given vertex.
//! 3. [`cycle_breaker`]: greedy minimum-weight edge cutting.
//! 4. [`topo`]: DFS topological order.
//! 5. [`utils`]: edge weight, read-before deps, edge dropping, dumps.

pub mod builder;
pub mod cycle_breaker;
pub mod tarjan;
pub mod topo;
pub mod utils;

pub use builder::{BlockOwner, BlockTable, create_edges};
pub use cycle_breaker::CycleBreaker;
pub use tarjan::TarjanAlgorithm;
pub use topo::{topological_sort, verify_topological_order};
pub use utils::{
    add_read_before_dep, add_read_before_dep_extents, drop_incoming_edges_to,
    drop_write_before_deps, dump_graph, edge_weight,
};

use ipd_types::{AnnotatedOperation, Extent, InstallOperation};
use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

/// Stable arena index of a vertex.
pub type VertexIndex = usize;

/// `(src, dst)`: `dst` must run before `src`.
pub type Edge = (VertexIndex, VertexIndex);

/// Dependency payload of an edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeProperties {
    /// Read-before blocks: the destination vertex reads these blocks, which
    /// the source vertex overwrites.
    pub extents: Vec<Extent>,
    /// Write-before blocks: only set on edges into move-to-scratch helper
    /// vertices.
    pub write_extents: Vec<Extent>,
}

impl EdgeProperties {
    #[must_use]
    pub fn read_before(extents: Vec<Extent>) -> Self {
        Self {
            extents,
            write_extents: Vec::new(),
        }
    }

    #[must_use]
    pub fn write_before(write_extents: Vec<Extent>) -> Self {
        Self {
            extents: Vec::new(),
            write_extents,
        }
    }
}

/// One operation in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    /// Tombstone flag. Invalid vertices keep their slot.
    pub valid: bool,
    /// Ordered by destination index for deterministic traversal.
    pub out_edges: BTreeMap<VertexIndex, EdgeProperties>,
    /// Tarjan scratch: discovery index, `None` before each run.
    pub index: Option<usize>,
    /// Tarjan scratch: lowest reachable discovery index.
    pub lowlink: Option<usize>,
    pub aop: AnnotatedOperation,
}

impl Vertex {
    #[must_use]
    pub fn new(aop: AnnotatedOperation) -> Self {
        Self {
            valid: true,
            out_edges: BTreeMap::new(),
            index: None,
            lowlink: None,
            aop,
        }
    }

    #[must_use]
    pub fn op(&self) -> &InstallOperation {
        &self.aop.op
    }

    pub fn op_mut(&mut self) -> &mut InstallOperation {
        &mut self.aop.op
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.aop.name
    }
}

/// Arena of vertices with soft delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    vertices: Vec<Vertex>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Append a vertex and return its index.
    pub fn push(&mut self, vertex: Vertex) -> VertexIndex {
        self.vertices.push(vertex);
        self.vertices.len() - 1
    }

    /// Append a vertex for `aop` and return its index.
    pub fn add_operation(&mut self, aop: AnnotatedOperation) -> VertexIndex {
        self.push(Vertex::new(aop))
    }

    #[must_use]
    pub fn get(&self, index: VertexIndex) -> Option<&Vertex> {
        self.vertices.get(index)
    }

    pub fn get_mut(&mut self, index: VertexIndex) -> Option<&mut Vertex> {
        self.vertices.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vertex> {
        self.vertices.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Vertex> {
        self.vertices.iter_mut()
    }

    /// Properties of edge `(src, dst)` if it exists.
    #[must_use]
    pub fn edge(&self, (src, dst): Edge) -> Option<&EdgeProperties> {
        self.vertices.get(src)?.out_edges.get(&dst)
    }

    #[must_use]
    pub fn has_edge(&self, edge: Edge) -> bool {
        self.edge(edge).is_some()
    }

    /// Remove edge `(src, dst)`, returning its properties.
    pub fn remove_edge(&mut self, (src, dst): Edge) -> Option<EdgeProperties> {
        self.vertices.get_mut(src)?.out_edges.remove(&dst)
    }

    /// Every edge in the graph, in `(src, dst)` order.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.vertices
            .iter()
            .enumerate()
            .flat_map(|(src, vertex)| vertex.out_edges.keys().map(move |&dst| (src, dst)))
            .collect()
    }

    /// Indices of valid vertices, ascending.
    #[must_use]
    pub fn valid_indices(&self) -> Vec<VertexIndex> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, vertex)| vertex.valid)
            .map(|(index, _)| index)
            .collect()
    }
}

impl Index<VertexIndex> for Graph {
    type Output = Vertex;

    fn index(&self, index: VertexIndex) -> &Vertex {
        &self.vertices[index]
    }
}

impl IndexMut<VertexIndex> for Graph {
    fn index_mut(&mut self, index: VertexIndex) -> &mut Vertex {
        &mut self.vertices[index]
    }
}

impl FromIterator<Vertex> for Graph {
    fn from_iter<I: IntoIterator<Item = Vertex>>(iter: I) -> Self {
        Self {
            vertices: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Graph {
    type Item = &'a Vertex;
    type IntoIter = std::slice::Iter<'a, Vertex>;

    fn into_iter(self) -> Self::IntoIter {
        self.vertices.iter()
    }
}
