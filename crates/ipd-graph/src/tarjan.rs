//! Tarjan's strongly connected components, restricted to the component that
//! contains one required vertex.
//!
//! Bookkeeping lives in the `index` / `lowlink` fields of each [`Vertex`]
//! (reset before every run). The DFS runs on an explicit frame stack so
//! adversarial graphs cannot overflow the call stack.
//!
//! [`Vertex`]: crate::Vertex

use crate::{Graph, VertexIndex};
use tracing::trace;

/// One suspended DFS call: the vertex, its successors and the next one to
/// visit.
struct Frame {
    vertex: VertexIndex,
    successors: Vec<VertexIndex>,
    next: usize,
}

/// Reusable Tarjan state.
#[derive(Debug, Default)]
pub struct TarjanAlgorithm {
    next_index: usize,
    stack: Vec<VertexIndex>,
    on_stack: Vec<bool>,
    required: VertexIndex,
    component: Vec<VertexIndex>,
}

impl TarjanAlgorithm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the strongly connected component containing `vertex`, in the
    /// order its members were popped off the Tarjan stack. Only vertices
    /// reachable from `vertex` are explored; other components are ignored.
    pub fn execute(&mut self, vertex: VertexIndex, graph: &mut Graph) -> Vec<VertexIndex> {
        self.next_index = 0;
        self.stack.clear();
        self.on_stack.clear();
        self.on_stack.resize(graph.len(), false);
        self.required = vertex;
        self.component.clear();
        for v in graph.iter_mut() {
            v.index = None;
            v.lowlink = None;
        }

        if graph.get(vertex).is_some_and(|v| v.valid) {
            self.strong_connect(vertex, graph);
        }
        trace!(
            vertex,
            component_size = self.component.len(),
            "tarjan_component"
        );
        std::mem::take(&mut self.component)
    }

    fn visit(&mut self, vertex: VertexIndex, graph: &mut Graph, frames: &mut Vec<Frame>) {
        let v = &mut graph[vertex];
        v.index = Some(self.next_index);
        v.lowlink = Some(self.next_index);
        self.next_index += 1;
        self.stack.push(vertex);
        self.on_stack[vertex] = true;
        let successors = graph[vertex]
            .out_edges
            .keys()
            .copied()
            .filter(|&w| graph.get(w).is_some_and(|target| target.valid))
            .collect();
        frames.push(Frame {
            vertex,
            successors,
            next: 0,
        });
    }

    fn strong_connect(&mut self, root: VertexIndex, graph: &mut Graph) {
        let mut frames = Vec::new();
        self.visit(root, graph, &mut frames);

        while let Some(frame) = frames.last_mut() {
            let v = frame.vertex;
            if let Some(&w) = frame.successors.get(frame.next) {
                frame.next += 1;
                match graph[w].index {
                    None => self.visit(w, graph, &mut frames),
                    Some(w_index) if self.on_stack[w] => {
                        lower_lowlink(graph, v, w_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            let v_lowlink = graph[v].lowlink.unwrap_or(usize::MAX);
            if graph[v].index == Some(v_lowlink) {
                self.close_component(v);
            }
            if let Some(parent) = frames.last() {
                lower_lowlink(graph, parent.vertex, v_lowlink);
            }
        }
    }

    /// Pop the component rooted at `v`; keep it if it holds the required
    /// vertex.
    fn close_component(&mut self, v: VertexIndex) {
        let mut members = Vec::new();
        while let Some(w) = self.stack.pop() {
            self.on_stack[w] = false;
            members.push(w);
            if w == v {
                break;
            }
        }
        if members.contains(&self.required) {
            self.component = members;
        }
    }
}

fn lower_lowlink(graph: &mut Graph, vertex: VertexIndex, candidate: usize) {
    let lowlink = &mut graph[vertex].lowlink;
    *lowlink = Some(lowlink.map_or(candidate, |current| current.min(candidate)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blank_graph, weighted};

    fn graph_with_edges(count: usize, edges: &[(usize, usize)]) -> Graph {
        let mut graph = blank_graph(count);
        for &(src, dst) in edges {
            graph[src].out_edges.insert(dst, weighted(0, 1));
        }
        graph
    }

    fn sorted(mut component: Vec<VertexIndex>) -> Vec<VertexIndex> {
        component.sort_unstable();
        component
    }

    #[test]
    fn finds_component_of_required_vertex_only() {
        // {0,1,2} cycle, {3,4} cycle, 2 -> 3 bridge, 5 isolated.
        let mut graph = graph_with_edges(6, &[(0, 1), (1, 2), (2, 0), (2, 3), (3, 4), (4, 3)]);
        let mut tarjan = TarjanAlgorithm::new();
        assert_eq!(sorted(tarjan.execute(0, &mut graph)), vec![0, 1, 2]);
        assert_eq!(sorted(tarjan.execute(4, &mut graph)), vec![3, 4]);
        assert_eq!(tarjan.execute(5, &mut graph), vec![5]);
    }

    #[test]
    fn unreachable_vertices_are_not_indexed() {
        let mut graph = graph_with_edges(4, &[(0, 1), (1, 0), (2, 3), (3, 2)]);
        let mut tarjan = TarjanAlgorithm::new();
        assert_eq!(sorted(tarjan.execute(1, &mut graph)), vec![0, 1]);
        assert!(graph[2].index.is_none());
        assert!(graph[3].lowlink.is_none());
    }

    #[test]
    fn acyclic_vertex_is_trivial_component() {
        let mut graph = graph_with_edges(3, &[(0, 1), (1, 2)]);
        let mut tarjan = TarjanAlgorithm::new();
        assert_eq!(tarjan.execute(0, &mut graph), vec![0]);
    }

    #[test]
    fn tombstoned_vertices_break_components() {
        let mut graph = graph_with_edges(3, &[(0, 1), (1, 2), (2, 0)]);
        graph[2].valid = false;
        let mut tarjan = TarjanAlgorithm::new();
        assert_eq!(tarjan.execute(0, &mut graph), vec![0]);
    }

    #[test]
    fn long_chain_cycle_does_not_recurse() {
        let count = 50_000;
        let mut edges: Vec<(usize, usize)> = (0..count - 1).map(|i| (i, i + 1)).collect();
        edges.push((count - 1, 0));
        let mut graph = graph_with_edges(count, &edges);
        let mut tarjan = TarjanAlgorithm::new();
        assert_eq!(tarjan.execute(0, &mut graph).len(), count);
    }
}
