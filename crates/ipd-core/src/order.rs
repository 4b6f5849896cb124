//! Operation order helpers: reverse position lookup, cut sorting and moving
//! full operations to the back.

use crate::cut::CutEdgeVertexes;
use ipd_graph::{Graph, VertexIndex};
use tracing::info;

/// `map[vertex] == Some(position of vertex in order)`. Sized to the largest
/// vertex named in `order`; vertices not in `order` map to `None`.
#[must_use]
pub fn generate_reverse_topo_order_map(order: &[VertexIndex]) -> Vec<Option<usize>> {
    let len = order.iter().max().map_or(0, |&max| max + 1);
    let mut map = vec![None; len];
    for (position, &vertex) in order.iter().enumerate() {
        map[vertex] = Some(position);
    }
    map
}

/// Position of `vertex` in the order described by `reverse`.
#[must_use]
pub fn position_of(reverse: &[Option<usize>], vertex: VertexIndex) -> Option<usize> {
    reverse.get(vertex).copied().flatten()
}

/// Stable sort of `cuts` by the position of their `old_dst` in the order.
/// Cuts whose `old_dst` is not in the order sort last.
pub fn sort_cuts_by_topo_order(cuts: &mut [CutEdgeVertexes], reverse: &[Option<usize>]) {
    cuts.sort_by_key(|cut| position_of(reverse, cut.old_dst).unwrap_or(usize::MAX));
}

/// Keep non-full operations in their relative order and move REPLACE /
/// REPLACE_BZ operations after them, sorted by first destination block.
/// Full operations without destination extents go last. Returns the number
/// of full operations.
pub fn move_and_sort_full_ops_to_back(graph: &Graph, order: &mut Vec<VertexIndex>) -> usize {
    let (mut full_ops, mut rest): (Vec<VertexIndex>, Vec<VertexIndex>) = order
        .iter()
        .partition(|&&vertex| graph[vertex].op().op_type.is_full());
    full_ops.sort_by_key(|&vertex| {
        graph[vertex]
            .op()
            .first_dst_block()
            .map_or((1, 0), |start| (0, start))
    });
    let full_count = full_ops.len();
    info!(
        full_ops = full_count,
        total_ops = full_count + rest.len(),
        "full_ops_moved_to_back"
    );
    rest.append(&mut full_ops);
    *order = rest;
    full_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ext, op_vertex};
    use ipd_types::OperationType;
    use proptest::prelude::*;

    fn cut(old_dst: VertexIndex, new_vertex: VertexIndex) -> CutEdgeVertexes {
        CutEdgeVertexes {
            new_vertex,
            old_src: 0,
            old_dst,
            tmp_extents: Vec::new(),
        }
    }

    #[test]
    fn reverse_map_inverts_order() {
        let map = generate_reverse_topo_order_map(&[4, 0, 2]);
        assert_eq!(map, vec![Some(1), None, Some(2), None, Some(0)]);
        assert_eq!(position_of(&map, 4), Some(0));
        assert_eq!(position_of(&map, 3), None);
        assert_eq!(position_of(&map, 9), None);
        assert!(generate_reverse_topo_order_map(&[]).is_empty());
    }

    #[test]
    fn cuts_sorted_by_old_dst_position() {
        let reverse = generate_reverse_topo_order_map(&[3, 1, 2, 0]);
        let mut cuts = vec![cut(0, 10), cut(1, 11), cut(3, 12), cut(1, 13), cut(7, 14)];
        sort_cuts_by_topo_order(&mut cuts, &reverse);
        let new_vertices: Vec<_> = cuts.iter().map(|c| c.new_vertex).collect();
        assert_eq!(new_vertices, vec![12, 11, 13, 10, 14]);
    }

    #[test]
    fn full_ops_move_to_back_sorted_by_destination() {
        // A=REPLACE, B=BSDIFF, C=REPLACE_BZ, D=MOVE, no destinations.
        let graph: Graph = [
            OperationType::Replace,
            OperationType::Bsdiff,
            OperationType::ReplaceBz,
            OperationType::Move,
        ]
        .into_iter()
        .map(|op_type| op_vertex(op_type, &[], &[]))
        .collect();
        let mut order = vec![0, 1, 2, 3];
        assert_eq!(move_and_sort_full_ops_to_back(&graph, &mut order), 2);
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn full_ops_ordered_by_first_destination_block() {
        let graph: Graph = vec![
            op_vertex(OperationType::ReplaceBz, &[], &[ext(40, 1)]),
            op_vertex(OperationType::Move, &[ext(1, 1)], &[ext(2, 1)]),
            op_vertex(OperationType::Replace, &[], &[]),
            op_vertex(OperationType::Replace, &[], &[ext(7, 2), ext(0, 1)]),
            op_vertex(OperationType::Bsdiff, &[ext(3, 1)], &[ext(3, 1)]),
        ]
        .into_iter()
        .collect();
        let mut order = vec![2, 0, 3, 1, 4];
        move_and_sort_full_ops_to_back(&graph, &mut order);
        assert_eq!(order, vec![1, 4, 3, 0, 2]);
    }

    const TYPES: [OperationType; 4] = [
        OperationType::Move,
        OperationType::Bsdiff,
        OperationType::Replace,
        OperationType::ReplaceBz,
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn full_ops_partition_is_stable_and_sorted(
            ops in proptest::collection::vec((0_usize..4, proptest::option::of(0_u64..32)), 0..24),
        ) {
            let graph: Graph = ops
                .iter()
                .map(|&(kind, start)| {
                    let dst: Vec<_> = start.map(|block| ext(block, 1)).into_iter().collect();
                    op_vertex(TYPES[kind], &[], &dst)
                })
                .collect();
            let original: Vec<VertexIndex> = (0..graph.len()).rev().collect();
            let mut order = original.clone();
            let full_count = move_and_sort_full_ops_to_back(&graph, &mut order);

            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..graph.len()).collect::<Vec<_>>());

            let split = order.len() - full_count;
            let expected_rest: Vec<_> = original
                .iter()
                .copied()
                .filter(|&vertex| !graph[vertex].op().op_type.is_full())
                .collect();
            prop_assert_eq!(&order[..split], &expected_rest[..]);

            let keys: Vec<_> = order[split..]
                .iter()
                .map(|&vertex| graph[vertex].op().first_dst_block().map_or((1, 0), |b| (0, b)))
                .collect();
            prop_assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
