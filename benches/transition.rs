use criterion::*;
use staged_ecs::Context;
use std::hint::black_box;

mod common;
use common::*;

fn transition_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");

    // Cached-edge hot path: every add/remove after the first resolves its
    // destination table through the edge on the source table.
    group.bench_function("toggle_component_10k", |b| {
        b.iter_batched(
            || {
                let mut world = make_world();
                let entities = populate(&mut world, ENTITIES_SMALL);
                (world, entities)
            },
            |(mut world, entities)| {
                for &e in &entities {
                    world.add_component(Context::World, e, MASS).unwrap();
                    world.remove_component(Context::World, e, MASS).unwrap();
                }
                black_box(world);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("staged_toggle_10k", |b| {
        b.iter_batched(
            || {
                let mut world = make_world();
                let entities = populate(&mut world, ENTITIES_SMALL);
                (world, entities)
            },
            |(mut world, entities)| {
                world.begin_progress();
                for &e in &entities {
                    world.add_component(Context::World, e, MASS).unwrap();
                }
                world.end_progress().unwrap();
                black_box(world);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, transition_benchmark);
criterion_main!(benches);
