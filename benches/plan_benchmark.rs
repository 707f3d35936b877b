use cmdbatch::graph::{GraphValidator, PlanBuilder};
use cmdbatch::model::{BatchConfiguration, Command, Dependency, ExecutionMode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `layers` layers of `width` commands, each depending on two commands of the previous layer
fn layered_graph(layers: usize, width: usize) -> (Vec<Command>, Vec<Dependency>) {
    let id = |layer: usize, slot: usize| format!("l{}_{}", layer, slot);

    let commands = (0..layers)
        .flat_map(|layer| (0..width).map(move |slot| (layer, slot)))
        .map(|(layer, slot)| Command::wait(id(layer, slot), 10))
        .collect();

    let mut dependencies = Vec::new();
    for layer in 1..layers {
        for slot in 0..width {
            dependencies.push(Dependency::completion(id(layer - 1, slot), id(layer, slot)));
            dependencies.push(Dependency::completion(id(layer - 1, (slot + 1) % width), id(layer, slot)));
        }
    }

    (commands, dependencies)
}

fn benchmark_validation(c: &mut Criterion) {
    let validator = GraphValidator::new();
    let configuration = BatchConfiguration::new("bench");
    let mut group = c.benchmark_group("validate");

    for layers in [10, 50, 200] {
        let (commands, dependencies) = layered_graph(layers, 20);
        group.bench_with_input(BenchmarkId::from_parameter(layers * 20), &layers, |b, _| {
            b.iter(|| validator.validate(black_box(&commands), black_box(&dependencies), &configuration))
        });
    }
    group.finish();
}

fn benchmark_planning(c: &mut Criterion) {
    let planner = PlanBuilder::new();
    let mut group = c.benchmark_group("plan_mixed");

    for layers in [10, 50, 200] {
        let (commands, dependencies) = layered_graph(layers, 20);
        group.bench_with_input(BenchmarkId::from_parameter(layers * 20), &layers, |b, _| {
            b.iter(|| planner.build(black_box(&commands), black_box(&dependencies), ExecutionMode::Mixed))
        });
    }
    group.finish();

    let (commands, dependencies) = layered_graph(100, 20);
    c.bench_function("plan_sequential_2000", |b| {
        b.iter(|| planner.build(black_box(&commands), black_box(&dependencies), ExecutionMode::Sequential))
    });
}

criterion_group!(benches, benchmark_validation, benchmark_planning);
criterion_main!(benches);
