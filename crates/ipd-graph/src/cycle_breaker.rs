//! Greedy cycle breaking.
//!
//! For each root vertex (ascending), repeatedly take the strongly connected
//! component containing the root in a working copy of the graph and run a
//! Johnson-style circuit search from the root over that component. Each
//! circuit found that contains no edge already cut has its lowest-weight edge
//! cut. Once the root sits in no nontrivial component it is removed from the
//! working copy and the next root is processed.
//!
//! Cutting the lowest-weight edge of each circuit found is a local heuristic.
//! A minimum feedback edge set is NP-hard; this only guarantees the result
//! is acyclic.

use crate::{Edge, Graph, TarjanAlgorithm, VertexIndex, edge_weight};
use ipd_error::{IpdError, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, trace};

/// One suspended circuit-search call.
struct Frame {
    vertex: VertexIndex,
    successors: Vec<VertexIndex>,
    next: usize,
    found: bool,
}

/// Cycle breaker state. Reusable across graphs.
#[derive(Debug, Default)]
pub struct CycleBreaker {
    /// Working copy. Cut edges and processed roots are removed from it.
    subgraph: Graph,
    /// Successors restricted to the current component.
    component_edges: Vec<BTreeSet<VertexIndex>>,
    blocked: Vec<bool>,
    /// Johnson's `B` lists: `blocked_graph[w]` holds vertices to unblock
    /// when `w` is unblocked.
    blocked_graph: Vec<HashSet<VertexIndex>>,
    stack: Vec<VertexIndex>,
    root: VertexIndex,
    cut_edges: BTreeSet<Edge>,
    skipped_ops: usize,
}

impl CycleBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertices never used as circuit roots in the last run. Diagnostic only.
    #[must_use]
    pub fn skipped_ops(&self) -> usize {
        self.skipped_ops
    }

    /// Return a set of edges whose removal leaves `graph` acyclic.
    ///
    /// `graph` is not modified. Fails only if a nontrivial component yields
    /// no circuit, which would mean the search itself is broken.
    pub fn break_cycles(&mut self, graph: &Graph) -> Result<BTreeSet<Edge>> {
        self.subgraph = graph.clone();
        self.cut_edges.clear();
        self.skipped_ops = 0;
        let count = graph.len();

        let mut has_incoming = vec![false; count];
        for vertex in graph {
            for &dst in vertex.out_edges.keys() {
                if let Some(flag) = has_incoming.get_mut(dst) {
                    *flag = true;
                }
            }
        }

        let mut tarjan = TarjanAlgorithm::new();
        for root in 0..count {
            if root > 0 {
                self.remove_from_subgraph(root - 1);
            }
            let vertex = &self.subgraph[root];
            if !vertex.valid {
                continue;
            }
            if vertex.op().op_type.is_full()
                || !has_incoming[root]
                || vertex.out_edges.is_empty()
            {
                self.skipped_ops += 1;
                continue;
            }

            loop {
                let component = tarjan.execute(root, &mut self.subgraph);
                if component.len() <= 1 {
                    break;
                }
                self.prepare_component(root, &component);
                let cuts_before = self.cut_edges.len();
                self.circuit(root);
                if self.cut_edges.len() == cuts_before {
                    return Err(IpdError::invariant(format!(
                        "no circuit found through vertex {root} in a {}-vertex component",
                        component.len()
                    )));
                }
                trace!(
                    root,
                    component_size = component.len(),
                    cuts = self.cut_edges.len() - cuts_before,
                    "cycle_breaker_component"
                );
            }
        }

        let cut_weight: u64 = self
            .cut_edges
            .iter()
            .map(|&edge| edge_weight(graph, edge))
            .sum();
        info!(
            vertices = count,
            cut_edges = self.cut_edges.len(),
            cut_weight,
            skipped_ops = self.skipped_ops,
            "cycle_breaker_done"
        );
        Ok(std::mem::take(&mut self.cut_edges))
    }

    /// Drop every edge into and out of `vertex` from the working copy.
    fn remove_from_subgraph(&mut self, vertex: VertexIndex) {
        self.subgraph[vertex].out_edges.clear();
        for other in self.subgraph.iter_mut() {
            other.out_edges.remove(&vertex);
        }
    }

    fn prepare_component(&mut self, root: VertexIndex, component: &[VertexIndex]) {
        let count = self.subgraph.len();
        let members: BTreeSet<VertexIndex> = component.iter().copied().collect();

        self.component_edges.clear();
        self.component_edges.resize(count, BTreeSet::new());
        for &v in component {
            self.component_edges[v] = self.subgraph[v]
                .out_edges
                .keys()
                .copied()
                .filter(|w| members.contains(w))
                .collect();
        }
        self.blocked.clear();
        self.blocked.resize(count, false);
        self.blocked_graph.clear();
        self.blocked_graph.resize(count, HashSet::new());
        self.stack.clear();
        self.root = root;
    }

    fn push_frame(&mut self, vertex: VertexIndex, frames: &mut Vec<Frame>) {
        self.stack.push(vertex);
        self.blocked[vertex] = true;
        frames.push(Frame {
            vertex,
            successors: self.component_edges[vertex].iter().copied().collect(),
            next: 0,
            found: false,
        });
    }

    /// Johnson's CIRCUIT on an explicit frame stack, cutting an edge per
    /// circuit instead of reporting it.
    fn circuit(&mut self, root: VertexIndex) {
        let mut frames = Vec::new();
        self.push_frame(root, &mut frames);

        while let Some(frame) = frames.last_mut() {
            let v = frame.vertex;
            if let Some(&w) = frame.successors.get(frame.next) {
                frame.next += 1;
                if self.cut_edges.contains(&(v, w)) {
                    continue;
                }
                if w == self.root {
                    frame.found = true;
                    self.handle_circuit();
                } else if !self.blocked[w] {
                    self.push_frame(w, &mut frames);
                }
                continue;
            }

            let Some(done) = frames.pop() else { break };
            if done.found {
                self.unblock(done.vertex);
            } else {
                for &w in &done.successors {
                    self.blocked_graph[w].insert(done.vertex);
                }
            }
            self.stack.pop();

            if done.found {
                if let Some(parent) = frames.last_mut() {
                    parent.found = true;
                    // Every remaining circuit through this prefix is already
                    // broken.
                    if self.stack_contains_cut_edge() {
                        parent.next = parent.successors.len();
                    }
                }
            }
        }
    }

    /// The stack plus the closing edge back to the root is a circuit. Cut its
    /// lightest edge unless an edge on it is already cut.
    fn handle_circuit(&mut self) {
        let mut path = self.stack.clone();
        path.push(self.root);

        let mut lightest: Option<(Edge, u64)> = None;
        for pair in path.windows(2) {
            let edge = (pair[0], pair[1]);
            if self.cut_edges.contains(&edge) {
                return;
            }
            let weight = edge_weight(&self.subgraph, edge);
            if lightest.is_none_or(|(_, best)| weight < best) {
                lightest = Some((edge, weight));
            }
        }

        if let Some((edge, weight)) = lightest {
            debug!(
                src = edge.0,
                dst = edge.1,
                weight,
                circuit_len = path.len() - 1,
                "cycle_edge_cut"
            );
            self.cut_edges.insert(edge);
            self.subgraph.remove_edge(edge);
        }
    }

    fn stack_contains_cut_edge(&self) -> bool {
        self.stack
            .windows(2)
            .any(|pair| self.cut_edges.contains(&(pair[0], pair[1])))
    }

    fn unblock(&mut self, vertex: VertexIndex) {
        let mut work = vec![vertex];
        while let Some(u) = work.pop() {
            self.blocked[u] = false;
            for w in std::mem::take(&mut self.blocked_graph[u]) {
                if self.blocked[w] {
                    work.push(w);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blank_graph, vertex, weighted};
    use crate::{topological_sort, verify_topological_order};
    use ipd_types::OperationType;
    use proptest::prelude::*;

    fn graph_with_weights(count: usize, edges: &[(usize, usize, u64)]) -> Graph {
        let mut graph = blank_graph(count);
        for &(src, dst, weight) in edges {
            graph[src].out_edges.insert(dst, weighted(100 * src as u64, weight));
        }
        graph
    }

    fn remove_cuts(graph: &mut Graph, cuts: &BTreeSet<Edge>) {
        for &edge in cuts {
            assert!(graph.remove_edge(edge).is_some(), "cut {edge:?} not in graph");
        }
    }

    #[test]
    fn two_cycle_cuts_lighter_edge() {
        // A -> B weight 3, B -> A weight 1.
        let graph = graph_with_weights(2, &[(0, 1, 3), (1, 0, 1)]);
        let mut breaker = CycleBreaker::new();
        let cuts = breaker.break_cycles(&graph).expect("break");
        assert_eq!(cuts, BTreeSet::from([(1, 0)]));
    }

    #[test]
    fn acyclic_graph_has_no_cuts() {
        let graph = graph_with_weights(4, &[(0, 1, 1), (1, 2, 1), (0, 3, 1)]);
        let mut breaker = CycleBreaker::new();
        assert!(breaker.break_cycles(&graph).expect("break").is_empty());
    }

    #[test]
    fn shared_light_edge_breaks_both_cycles() {
        // 0 -> 1 -> 2 -> 0 and 0 -> 1 -> 3 -> 0, with 0 -> 1 lightest.
        let graph = graph_with_weights(
            4,
            &[(0, 1, 1), (1, 2, 5), (2, 0, 5), (1, 3, 5), (3, 0, 5)],
        );
        let mut breaker = CycleBreaker::new();
        let cuts = breaker.break_cycles(&graph).expect("break");
        assert_eq!(cuts, BTreeSet::from([(0, 1)]));
    }

    #[test]
    fn disjoint_cycles_each_lose_one_edge() {
        let graph = graph_with_weights(
            4,
            &[(0, 1, 4), (1, 0, 2), (2, 3, 1), (3, 2, 9)],
        );
        let mut breaker = CycleBreaker::new();
        let cuts = breaker.break_cycles(&graph).expect("break");
        assert_eq!(cuts, BTreeSet::from([(1, 0), (2, 3)]));
    }

    #[test]
    fn ties_go_to_first_edge_from_root() {
        let graph = graph_with_weights(3, &[(0, 1, 2), (1, 2, 2), (2, 0, 2)]);
        let mut breaker = CycleBreaker::new();
        let cuts = breaker.break_cycles(&graph).expect("break");
        assert_eq!(cuts, BTreeSet::from([(0, 1)]));
    }

    #[test]
    fn sources_sinks_and_full_ops_are_skipped() {
        let mut graph: Graph = vec![
            vertex("full", OperationType::Replace, &[], &[(0, 1)]),
            vertex("a", OperationType::Move, &[(0, 1)], &[(1, 1)]),
            vertex("b", OperationType::Move, &[(1, 1)], &[(2, 1)]),
        ]
        .into_iter()
        .collect();
        graph[0].out_edges.insert(1, weighted(0, 1));
        graph[1].out_edges.insert(2, weighted(1, 1));
        let mut breaker = CycleBreaker::new();
        assert!(breaker.break_cycles(&graph).expect("break").is_empty());
        // 0: full, 1: has incoming and out-edges, 2: no out-edges.
        assert_eq!(breaker.skipped_ops(), 2);
    }

    #[test]
    fn input_graph_is_untouched() {
        let graph = graph_with_weights(2, &[(0, 1, 3), (1, 0, 1)]);
        let before = graph.clone();
        CycleBreaker::new().break_cycles(&graph).expect("break");
        assert_eq!(graph, before);
    }

    #[test]
    fn dense_component_becomes_acyclic() {
        let count = 6;
        let mut edges = Vec::new();
        for src in 0..count {
            for dst in 0..count {
                if src != dst {
                    edges.push((src, dst, (src * 7 + dst * 3) as u64 % 5 + 1));
                }
            }
        }
        let mut graph = graph_with_weights(count, &edges);
        let cuts = CycleBreaker::new().break_cycles(&graph).expect("break");
        remove_cuts(&mut graph, &cuts);
        let order = topological_sort(&graph);
        verify_topological_order(&graph, &order).expect("acyclic after cuts");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn cutting_always_yields_acyclic_graph(
            count in 1_usize..14,
            raw_edges in proptest::collection::vec((0_usize..14, 0_usize..14, 1_u64..6), 0..60),
        ) {
            let edges: Vec<_> = raw_edges
                .into_iter()
                .filter(|&(src, dst, _)| src < count && dst < count && src != dst)
                .collect();
            let mut graph = graph_with_weights(count, &edges);
            let cuts = CycleBreaker::new().break_cycles(&graph).expect("break");
            for &edge in &cuts {
                prop_assert!(graph.remove_edge(edge).is_some());
            }
            let order = topological_sort(&graph);
            prop_assert!(verify_topological_order(&graph, &order).is_ok());
        }
    }
}
