use calcgrid_graph::{Graph, GraphBuilder};
use calcgrid_plan::{ExecutionPlan, PartitionConfig, Partitioner};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

/// `width` independent chains of `depth` nodes hanging off one market-data node.
fn portfolio(width: usize, depth: usize) -> Graph {
    let mut b = GraphBuilder::new("portfolio");
    b.declare_root_input("spot");
    b.add_node("seed", ["spot"], ["curve"]);
    for w in 0..width {
        let mut previous = "curve".to_string();
        for d in 0..depth {
            let value = format!("t{w}.{d}");
            b.add_node("sum", [previous.clone()], [value.clone()]);
            previous = value;
        }
        b.add_terminal_output(format!("pv{w}"), previous);
    }
    b.build().unwrap()
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    for width in [10, 100, 1_000] {
        let graph = portfolio(width, 8);
        for (label, config) in [
            ("identity", PartitionConfig::identity()),
            ("min4_max16", PartitionConfig::new(4, Some(16))),
            ("lanes", PartitionConfig::identity().with_concurrency_limit(4)),
        ] {
            group.bench_with_input(BenchmarkId::new(label, width), &graph, |b, graph| {
                let partitioner = Partitioner::new(config);
                b.iter(|| partitioner.partition(black_box(graph)).unwrap());
            });
        }
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let graph = Arc::new(portfolio(500, 8));
    c.bench_function("plan_500x8", |b| {
        b.iter(|| ExecutionPlan::build(Arc::clone(&graph), PartitionConfig::new(4, Some(16))).unwrap());
    });
}

criterion_group!(benches, bench_partition, bench_plan);
criterion_main!(benches);
