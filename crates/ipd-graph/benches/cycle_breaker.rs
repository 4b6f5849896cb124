//! Benchmark: cycle breaking and topological sort on synthetic cyclic graphs.
//!
//! Each graph is a ring of MOVE operations (every vertex waits on the next)
//! with chords every few vertices, so components are large and circuits
//! overlap.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ipd_graph::{CycleBreaker, EdgeProperties, Graph, Vertex, topological_sort};
use ipd_types::{AnnotatedOperation, Extent, InstallOperation, OperationType};

fn ring_with_chords(count: usize, chord_every: usize) -> Graph {
    let mut graph: Graph = (0..count)
        .map(|i| {
            let block = i as u64 * 4;
            Vertex::new(AnnotatedOperation::new(
                format!("op{i}"),
                InstallOperation::with_extents(
                    OperationType::Move,
                    vec![Extent::new(block, 4)],
                    vec![Extent::new(block + 4, 4)],
                ),
            ))
        })
        .collect();
    for i in 0..count {
        let next = (i + 1) % count;
        let weight = (i % 4) as u64 + 1;
        graph[i]
            .out_edges
            .insert(next, EdgeProperties::read_before(vec![Extent::new(i as u64 * 4, weight)]));
        if i % chord_every == 0 {
            let back = (i + count / 2) % count;
            graph[i]
                .out_edges
                .insert(back, EdgeProperties::read_before(vec![Extent::new(i as u64 * 4 + 1, 2)]));
        }
    }
    graph
}

fn bench_break_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("break_cycles");
    for &count in &[64_usize, 512, 2048] {
        let graph = ring_with_chords(count, 8);
        group.bench_with_input(BenchmarkId::from_parameter(count), &graph, |b, graph| {
            let mut breaker = CycleBreaker::new();
            b.iter(|| black_box(breaker.break_cycles(black_box(graph)).expect("break cycles")));
        });
    }
    group.finish();
}

fn bench_topological_sort(c: &mut Criterion) {
    let graph = ring_with_chords(4096, 8);
    c.bench_function("topological_sort_4096", |b| {
        b.iter(|| black_box(topological_sort(black_box(&graph))));
    });
}

criterion_group!(benches, bench_break_cycles, bench_topological_sort);
criterion_main!(benches);
