use staged_ecs::{Context, Entity, SigColumn, Signature, World};

const POSITION: Entity = Entity(10);
const VELOCITY: Entity = Entity(11);
const MASS: Entity = Entity(12);

fn setup() -> World {
    let mut world = World::new();
    world.register_component(POSITION, 8, 4).unwrap();
    world.register_component(VELOCITY, 8, 4).unwrap();
    world.register_component(MASS, 4, 4).unwrap();
    world
}

#[test]
fn staged_destroy_is_invisible_until_merge() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();

    let table = world.record(e).unwrap().table;
    let rows = world.table(table).count();

    world.begin_progress();
    world.destroy(Context::World, e).unwrap();

    // The main stage still holds the entity; the active stage sees it dead.
    assert_eq!(world.record(e).unwrap().table, table);
    assert_eq!(world.table(table).count(), rows);
    assert!(!world.is_alive(Context::World, e));

    world.end_progress().unwrap();

    assert!(world.record(e).is_none());
    assert_eq!(world.table(table).count(), rows - 1);
}

#[test]
fn destroy_in_a_worker_stage_applies_at_merge() {
    let mut world = setup();
    world.set_worker_count(1).unwrap();

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();
    let table = world.record(e).unwrap().table;
    let rows = world.table(table).count();

    world.begin_progress();
    world.destroy_from_worker(Context::Worker(2), e).unwrap();

    assert_eq!(world.record(e).unwrap().table, table);
    assert!(!world.is_alive(Context::Worker(2), e));
    world.end_progress().unwrap();

    assert!(world.record(e).is_none());
    assert_eq!(world.table(table).count(), rows - 1);
}

#[test]
fn staged_writes_are_isolated_until_merge() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    let before = 1u32.to_le_bytes();
    let after = 2u32.to_le_bytes();
    world.set_component(Context::World, e, MASS, &before).unwrap();

    world.begin_progress();
    world.set_component(Context::World, e, MASS, &after).unwrap();

    assert_eq!(world.get_component(e, MASS).unwrap(), &before);
    assert_eq!(world.get_staged(Context::World, e, MASS).unwrap(), &after);

    world.end_progress().unwrap();

    assert_eq!(world.get_component(e, MASS).unwrap(), &after);
    assert_eq!(world.get_staged(Context::World, e, MASS).unwrap(), &after);
}

#[test]
fn staged_adds_move_the_entity_after_merge() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    let pos = 3.5f64.to_le_bytes();
    world.set_component(Context::World, e, POSITION, &pos).unwrap();
    let old_table = world.record(e).unwrap().table;

    world.begin_progress();
    world
        .set_component(Context::World, e, VELOCITY, &9.0f64.to_le_bytes())
        .unwrap();

    // Main view is untouched mid-frame.
    assert!(!world.has_component(e, VELOCITY));
    assert_eq!(world.type_of(e).unwrap(), &[POSITION]);

    world.end_progress().unwrap();

    assert_eq!(world.type_of(e).unwrap(), &[POSITION, VELOCITY]);
    assert_ne!(world.record(e).unwrap().table, old_table);
    assert_eq!(world.get_component(e, POSITION).unwrap(), &pos);
    assert_eq!(
        world.get_component(e, VELOCITY).unwrap(),
        &9.0f64.to_le_bytes()
    );
}

#[test]
fn staged_removes_apply_at_merge() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();

    world.begin_progress();
    world.remove_component(Context::World, e, MASS).unwrap();
    assert!(world.has_component(e, MASS));
    world.end_progress().unwrap();

    assert!(!world.has_component(e, MASS));
    assert_eq!(world.type_of(e).unwrap(), &[POSITION]);
}

#[test]
fn staged_removal_of_the_last_component_releases_the_row() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();
    let table = world.record(e).unwrap().table;

    world.begin_progress();
    world.remove_component(Context::World, e, MASS).unwrap();
    world.end_progress().unwrap();

    assert!(world.is_alive(Context::World, e));
    assert_eq!(world.record(e).unwrap().row.row(), None);
    assert_eq!(world.type_of(e).unwrap(), &[] as &[Entity]);
    assert_eq!(world.table(table).count(), 0);
}

#[test]
fn entities_created_in_a_stage_appear_after_merge() {
    let mut world = setup();

    world.begin_progress();
    let e = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, e, MASS, &11u32.to_le_bytes())
        .unwrap();

    assert!(world.is_alive(Context::World, e));
    assert!(world.record(e).is_none());

    world.end_progress().unwrap();

    assert!(world.record(e).is_some());
    assert_eq!(world.get_component(e, MASS).unwrap(), &11u32.to_le_bytes());
}

#[test]
fn entities_created_and_destroyed_in_one_frame_never_materialise() {
    let mut world = setup();

    world.begin_progress();
    let e = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, e, MASS, &1u32.to_le_bytes())
        .unwrap();
    world.destroy(Context::World, e).unwrap();
    world.end_progress().unwrap();

    assert!(world.record(e).is_none());
    assert!(!world.is_alive(Context::World, e));
}

#[test]
fn staged_tables_become_visible_to_queries_after_merge() {
    let mut world = setup();
    let query = world.register_query(Signature::new(vec![
        SigColumn::require(POSITION),
        SigColumn::require(VELOCITY),
    ]));

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();

    world.begin_progress();
    world.add_component(Context::World, e, VELOCITY).unwrap();
    // The combined table does not exist yet as far as queries know.
    assert!(world.iterate(query).is_empty());
    world.end_progress().unwrap();

    let matched = world.iterate(query);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].table, world.record(e).unwrap().table);
}

#[test]
fn merge_updates_query_partitions() {
    let mut world = setup();
    let query = world.register_query(Signature::new(vec![SigColumn::require(MASS)]));

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, MASS).unwrap();
    let table = world.record(e).unwrap().table;
    assert_eq!(world.query(query).cache.tables().len(), 1);

    world.begin_progress();
    world.destroy(Context::World, e).unwrap();
    world.end_progress().unwrap();

    assert_eq!(world.query(query).cache.tables().len(), 0);
    assert_eq!(world.query(query).cache.raw_index(table), Some(-1));
}

#[test]
fn watched_flag_survives_a_staged_transition() {
    let mut world = setup();
    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, POSITION).unwrap();
    world.set_watched(Context::World, e, true).unwrap();

    world.begin_progress();
    world.add_component(Context::World, e, VELOCITY).unwrap();
    world.end_progress().unwrap();

    assert_eq!(world.watched(e), Some(true));
    assert!(world.has_component(e, VELOCITY));
}

#[test]
fn worker_stages_merge_in_ascending_stage_order() {
    let mut world = setup();
    world.set_worker_count(2).unwrap();

    let e = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, e, MASS, &0u32.to_le_bytes())
        .unwrap();

    world.begin_progress();
    // Stage 2 and stage 3 both write the same component; the higher stage
    // id merges later and wins.
    world
        .set_component(Context::Worker(2), e, MASS, &222u32.to_le_bytes())
        .unwrap();
    world
        .set_component(Context::Worker(3), e, MASS, &333u32.to_le_bytes())
        .unwrap();
    world.end_progress().unwrap();

    assert_eq!(world.get_component(e, MASS).unwrap(), &333u32.to_le_bytes());
}

#[test]
fn worker_reads_fall_back_to_the_main_stage() {
    let mut world = setup();
    world.set_worker_count(1).unwrap();

    let e = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, e, MASS, &7u32.to_le_bytes())
        .unwrap();

    world.begin_progress();
    assert_eq!(
        world.get_staged(Context::Worker(2), e, MASS).unwrap(),
        &7u32.to_le_bytes()
    );

    world
        .set_component(Context::Worker(2), e, MASS, &8u32.to_le_bytes())
        .unwrap();
    assert_eq!(
        world.get_staged(Context::Worker(2), e, MASS).unwrap(),
        &8u32.to_le_bytes()
    );
    // Another worker's stage still observes the main value.
    assert_eq!(world.get_component(e, MASS).unwrap(), &7u32.to_le_bytes());
    world.end_progress().unwrap();
}

#[test]
fn merges_are_reproducible_for_identical_deltas() {
    let run = || {
        let mut world = setup();
        world.set_worker_count(2).unwrap();
        let mut entities = Vec::new();
        for _ in 0..8 {
            entities.push(world.create(Context::World).unwrap());
        }
        world.begin_progress();
        for (i, &e) in entities.iter().enumerate() {
            let ctx = Context::Worker(2 + (i % 2) as i32);
            world
                .set_component_from_worker(ctx, e, MASS, &(i as u32).to_le_bytes())
                .unwrap();
            if i % 3 == 0 {
                world
                    .add_component_from_worker(ctx, e, POSITION)
                    .unwrap();
            }
        }
        world.end_progress().unwrap();

        let mut state: Vec<(u64, Vec<Entity>, Vec<u8>)> = entities
            .iter()
            .map(|&e| {
                (
                    e.0,
                    world.type_of(e).unwrap().to_vec(),
                    world.get_component(e, MASS).unwrap().to_vec(),
                )
            })
            .collect();
        state.sort();
        state
    };

    assert_eq!(run(), run());
}
