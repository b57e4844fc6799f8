use staged_ecs::{Context, Entity, Filter, FilterKind, World};

const A: Entity = Entity(10);
const B: Entity = Entity(11);
const C: Entity = Entity(12);
const D: Entity = Entity(13);

fn setup() -> World {
    let mut world = World::new();
    for id in [A, B, C, D] {
        world.register_component(id, 4, 4).unwrap();
    }
    world
}

/// Ten distinct component combinations, one table each.
const COMBOS: [&[Entity]; 10] = [
    &[A],
    &[B],
    &[C],
    &[D],
    &[A, B],
    &[A, C],
    &[A, D],
    &[B, C],
    &[B, D],
    &[A, B, C],
];

fn populate(world: &mut World, per_combo: usize) -> Vec<Entity> {
    let mut entities = Vec::new();
    for combo in COMBOS {
        for _ in 0..per_combo {
            let e = world.create(Context::World).unwrap();
            for &component in combo {
                let value = (e.0 as u32) ^ (component.0 as u32);
                world
                    .set_component(Context::World, e, component, &value.to_le_bytes())
                    .unwrap();
            }
            entities.push(e);
        }
    }
    entities
}

#[test]
fn snapshot_restore_snapshot_is_byte_equal() {
    let mut world = setup();
    let entities = populate(&mut world, 100);
    assert_eq!(entities.len(), 1_000);

    let image = world.snapshot(Filter::default());
    assert_eq!(
        image.tables.iter().filter(|t| !t.entities.is_empty()).count(),
        COMBOS.len() + 1, // the builtin component table is captured too
    );

    let mut fresh = setup();
    fresh.restore(&image).unwrap();
    let second = fresh.snapshot(Filter::default());

    assert_eq!(image, second);
}

#[test]
fn restore_reproduces_entities_types_and_values() {
    let mut world = setup();
    let entities = populate(&mut world, 10);

    let image = world.snapshot(Filter::default());
    let mut fresh = setup();
    fresh.restore(&image).unwrap();

    for e in entities {
        let original: Vec<Entity> = world.type_of(e).unwrap().to_vec();
        assert_eq!(fresh.type_of(e).unwrap(), original.as_slice());
        for &component in original.iter().filter(|c| c.is_component()) {
            assert_eq!(
                fresh.get_component(e, component),
                world.get_component(e, component)
            );
        }

        let record = fresh.record(e).unwrap();
        let row = record.row.row().unwrap();
        assert_eq!(fresh.table(record.table).data.entities[row], e);
    }
}

#[test]
fn restored_worlds_keep_allocating_fresh_handles() {
    let mut world = setup();
    populate(&mut world, 1);
    let highest = world.snapshot(Filter::default());

    let mut fresh = setup();
    fresh.restore(&highest).unwrap();

    let next = fresh.create(Context::World).unwrap();
    assert!(world.record(next).is_none());
    assert!(fresh.record(next).is_none()); // empty type, no row
    assert!(fresh.is_alive(Context::World, next));
    assert!(next.0 > highest.last_handle - 1);
}

#[test]
fn filters_restrict_the_captured_tables() {
    let mut world = setup();
    populate(&mut world, 5);

    let only_a = world.snapshot(Filter {
        include: vec![A],
        exclude: vec![],
        include_kind: FilterKind::MatchAll,
    });
    // [A], [A,B], [A,C], [A,D], [A,B,C]
    assert_eq!(only_a.tables.len(), 5);
    for table in &only_a.tables {
        assert!(table.type_ids.contains(&A));
    }

    let without_a = world.snapshot(Filter {
        include: vec![],
        exclude: vec![A],
        include_kind: FilterKind::MatchAll,
    });
    for table in &without_a.tables {
        assert!(!table.type_ids.contains(&A));
    }

    let exact = world.snapshot(Filter {
        include: vec![B, A],
        exclude: vec![],
        include_kind: FilterKind::MatchExact,
    });
    assert_eq!(exact.tables.len(), 1);
    assert_eq!(exact.tables[0].type_ids.as_ref(), &[A, B]);
}

#[test]
fn queries_survive_a_restore() {
    use staged_ecs::{SigColumn, Signature};

    let mut world = setup();
    populate(&mut world, 3);

    let query = world.register_query(Signature::new(vec![SigColumn::require(A)]));
    let before = world.iterate(query).len();
    assert!(before > 0);

    let image = world.snapshot(Filter::default());
    world.restore(&image).unwrap();
    assert_eq!(world.iterate(query).len(), before);
}
