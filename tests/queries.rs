use staged_ecs::{Context, Entity, SigColumn, Signature, World};

const POSITION: Entity = Entity(10);
const VELOCITY: Entity = Entity(11);
const MASS: Entity = Entity(12);
const HEALTH: Entity = Entity(13);

fn setup() -> World {
    let mut world = World::new();
    world.register_component(POSITION, 8, 4).unwrap();
    world.register_component(VELOCITY, 8, 4).unwrap();
    world.register_component(MASS, 4, 4).unwrap();
    world.register_component(HEALTH, 4, 4).unwrap();
    world
}

#[test]
fn and_columns_require_all_components() {
    let mut world = setup();

    let both = world.create(Context::World).unwrap();
    world.add_component(Context::World, both, POSITION).unwrap();
    world.add_component(Context::World, both, VELOCITY).unwrap();

    let only_pos = world.create(Context::World).unwrap();
    world.add_component(Context::World, only_pos, POSITION).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::require(VELOCITY),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(both).unwrap().table);
    assert_eq!(matched[0].columns, vec![1, 2]);
    assert_eq!(matched[0].components, vec![POSITION, VELOCITY]);
}

#[test]
fn queries_registered_before_tables_pick_them_up() {
    let mut world = setup();
    let query = world.register_query(Signature::new(vec![SigColumn::require(MASS)]));
    assert!(world.iterate(query).is_empty());

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(e).unwrap().table);
}

#[test]
fn not_columns_exclude_tables() {
    let mut world = setup();

    let plain = world.create(Context::World).unwrap();
    world.add_component(Context::World, plain, POSITION).unwrap();

    let tagged = world.create(Context::World).unwrap();
    world.add_component(Context::World, tagged, POSITION).unwrap();
    world.add_component(Context::World, tagged, HEALTH).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::without(HEALTH),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(plain).unwrap().table);
    // An excluded column maps to no data.
    assert_eq!(matched[0].columns[1], 0);
}

#[test]
fn optional_columns_match_either_way() {
    let mut world = setup();

    let with = world.create(Context::World).unwrap();
    world.add_component(Context::World, with, POSITION).unwrap();
    world.add_component(Context::World, with, MASS).unwrap();

    let without = world.create(Context::World).unwrap();
    world.add_component(Context::World, without, POSITION).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::optional(MASS),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 2);

    let with_table = world.record(with).unwrap().table;
    for m in matched {
        if m.table == with_table {
            assert!(m.columns[1] > 0);
        } else {
            assert_eq!(m.columns[1], 0);
        }
    }
}

#[test]
fn or_columns_admit_any_listed_component() {
    let mut world = setup();

    let a = world.create(Context::World).unwrap();
    world.add_component(Context::World, a, MASS).unwrap();

    let b = world.create(Context::World).unwrap();
    world.add_component(Context::World, b, HEALTH).unwrap();

    let c = world.create(Context::World).unwrap();
    world.add_component(Context::World, c, POSITION).unwrap();

    let query = world.register_query(Signature::new(vec![SigColumn::any_of(vec![
        MASS, HEALTH,
    ])]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 2);
    for m in &matched {
        let resolved = m.components[0];
        assert!(resolved == MASS || resolved == HEALTH);
        assert!(m.columns[0] > 0);
    }
}

#[test]
fn shared_components_resolve_through_prefabs() {
    let mut world = setup();

    let prefab = world.create(Context::World).unwrap();
    world.mark_prefab(Context::World, prefab).unwrap();
    world
        .set_component(Context::World, prefab, HEALTH, &99u32.to_le_bytes())
        .unwrap();

    let instance = world.create(Context::World).unwrap();
    world.add_component(Context::World, instance, POSITION).unwrap();
    world.add_component(Context::World, instance, prefab).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::require(HEALTH),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(instance).unwrap().table);

    // Shared data resolves through a reference, not a table column.
    assert!(matched[0].columns[1] < 0);
    let reference = matched[0].references[(-matched[0].columns[1] - 1) as usize];
    assert_eq!(reference.entity, prefab);
    assert_eq!(reference.component, HEALTH);

    // Owned-only signatures must not accept the inherited value.
    let owned = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::owned(HEALTH),
    ]));
    assert!(world.iterate(owned).is_empty());
}

#[test]
fn prefab_tables_are_skipped_unless_requested() {
    let mut world = setup();

    let prefab = world.create(Context::World).unwrap();
    world.mark_prefab(Context::World, prefab).unwrap();
    world
        .set_component(Context::World, prefab, POSITION, &0u64.to_le_bytes())
        .unwrap();

    let query = world.register_query(Signature::new(vec![SigColumn::require(POSITION)]));
    assert!(world.iterate(query).is_empty());

    let inclusive =
        world.register_query(Signature::new(vec![SigColumn::require(POSITION)]).matching_prefabs());
    assert_eq!(world.iterate(inclusive).len(), 1);
}

#[test]
fn container_columns_walk_the_parent_relationship() {
    let mut world = setup();

    let parent = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, parent, HEALTH, &10u32.to_le_bytes())
        .unwrap();

    let child = world.create(Context::World).unwrap();
    world.add_component(Context::World, child, POSITION).unwrap();
    world.add_child_of(Context::World, child, parent).unwrap();

    let orphan = world.create(Context::World).unwrap();
    world.add_component(Context::World, orphan, POSITION).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::container(HEALTH),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(child).unwrap().table);
    assert!(matched[0].columns[1] < 0);
    let reference = matched[0].references[(-matched[0].columns[1] - 1) as usize];
    assert_eq!(reference.entity, parent);
}

#[test]
fn cascade_orders_tables_by_ascending_depth() {
    let mut world = setup();

    // A chain of containers, each owning the cascade component.
    let root = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, root, HEALTH, &1u32.to_le_bytes())
        .unwrap();

    let middle = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, middle, HEALTH, &2u32.to_le_bytes())
        .unwrap();
    world.add_child_of(Context::World, middle, root).unwrap();

    // Leaf entities at depth 1 and depth 2, in distinct tables.
    let shallow = world.create(Context::World).unwrap();
    world.add_component(Context::World, shallow, POSITION).unwrap();
    world.add_child_of(Context::World, shallow, root).unwrap();

    let deep = world.create(Context::World).unwrap();
    world.add_component(Context::World, deep, POSITION).unwrap();
    world.add_component(Context::World, deep, MASS).unwrap();
    world.add_child_of(Context::World, deep, middle).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::cascade(HEALTH),
    ]));

    let matched = world.iterate(query);
    let depths: Vec<i32> = matched.iter().map(|m| m.depth).collect();
    assert_eq!(depths, vec![1, 2]);
    assert_eq!(matched[0].table, world.record(shallow).unwrap().table);
    assert_eq!(matched[1].table, world.record(deep).unwrap().table);
}

#[test]
fn fixed_source_columns_do_not_constrain_matching() {
    let mut world = setup();

    let source = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, source, MASS, &5u32.to_le_bytes())
        .unwrap();

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();

    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::from_entity(source, MASS),
    ]));

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert!(matched[0].columns[1] < 0);
    let reference = matched[0].references[(-matched[0].columns[1] - 1) as usize];
    assert_eq!(reference.entity, source);
    assert_eq!(reference.component, MASS);
}
