use staged_ecs::{
    Context, EntityIndex, Entity, PackedRow, Record, RecordState, World, WorldConfig,
    HI_ENTITY_ID,
};

const MASS: Entity = Entity(10);

#[test]
fn packed_row_encodes_row_and_watched_flag() {
    assert_eq!(PackedRow::EMPTY.row(), None);
    assert!(!PackedRow::EMPTY.is_watched());

    let row = PackedRow::at(5);
    assert_eq!(row.row(), Some(5));
    assert!(!row.is_watched());

    let watched = row.with_watched(true);
    assert_eq!(watched.row(), Some(5));
    assert!(watched.is_watched());

    let moved = watched.moved_to(9);
    assert_eq!(moved.row(), Some(9));
    assert!(moved.is_watched());

    let cleared = moved.cleared();
    assert_eq!(cleared.row(), None);
    assert!(cleared.is_watched());

    assert!(!watched.with_watched(false).is_watched());
}

#[test]
fn index_splits_low_and_high_ids() {
    let mut index = EntityIndex::new(false);
    let low = Entity(HI_ENTITY_ID - 1);
    let high = Entity(HI_ENTITY_ID);

    index.set(low, Record { table: 3, row: PackedRow::at(0) });
    index.set(high, Record { table: 4, row: PackedRow::at(1) });

    assert_eq!(index.get(low).unwrap().table, 3);
    assert_eq!(index.get(high).unwrap().table, 4);
    assert_eq!(index.count(), 2);

    assert!(index.remove(low).is_some());
    assert!(index.remove(high).is_some());
    assert_eq!(index.get(low), None);
    assert_eq!(index.get(high), None);
    assert_eq!(index.count(), 0);
}

#[test]
fn tombstones_are_kept_when_requested() {
    let mut index = EntityIndex::new(true);
    let low = Entity(7);
    let high = Entity(HI_ENTITY_ID + 7);

    for e in [low, high] {
        index.set(e, Record::default());
        index.remove(e);
    }

    assert_eq!(index.get(low), None);
    assert_eq!(index.state(low), Some(RecordState::Deleted));
    assert_eq!(index.state(high), Some(RecordState::Deleted));

    let tombstones = index
        .iterate()
        .filter(|(_, s)| matches!(s, RecordState::Deleted))
        .count();
    assert_eq!(tombstones, 2);
}

#[test]
fn generations_invalidate_stale_references() {
    let mut index = EntityIndex::new(false);
    let e = Entity(42);

    index.set(e, Record { table: 1, row: PackedRow::at(0) });
    let stale = index.make_ref(e);
    assert!(index.resolve(stale).is_some());

    index.remove(e);
    index.set(e, Record { table: 2, row: PackedRow::at(5) });

    assert!(index.resolve(stale).is_none());
    assert!(index.resolve(index.make_ref(e)).is_some());
}

#[test]
fn get_or_create_revives_tombstoned_entries() {
    let mut index = EntityIndex::new(true);
    let e = Entity(9);
    index.set(e, Record { table: 1, row: PackedRow::at(3) });
    index.remove(e);

    let record = index.get_or_create(e);
    assert_eq!(*record, Record::default());
    record.table = 8;
    assert_eq!(index.get(e).unwrap().table, 8);
    assert_eq!(index.count(), 1);
}

#[test]
fn entities_straddling_the_index_boundary_round_trip() {
    let mut world = World::with_config(WorldConfig {
        min_handle: HI_ENTITY_ID - 1,
        ..WorldConfig::default()
    });
    world.register_component(MASS, 4, 4).unwrap();

    let low = world.create(Context::World).unwrap();
    let high = world.create(Context::World).unwrap();
    assert_eq!(low.0, HI_ENTITY_ID - 1);
    assert_eq!(high.0, HI_ENTITY_ID);

    world
        .set_component(Context::World, low, MASS, &1u32.to_le_bytes())
        .unwrap();
    world
        .set_component(Context::World, high, MASS, &2u32.to_le_bytes())
        .unwrap();

    for (e, value) in [(low, 1u32), (high, 2u32)] {
        let record = world.record(e).unwrap();
        let row = record.row.row().unwrap();
        assert_eq!(world.table(record.table).data.entities[row], e);
        assert_eq!(world.get_component(e, MASS).unwrap(), &value.to_le_bytes());
    }

    world.destroy(Context::World, low).unwrap();
    assert!(!world.is_alive(Context::World, low));
    assert!(world.is_alive(Context::World, high));
}

#[test]
fn allocator_respects_the_handle_range() {
    let mut world = World::with_config(WorldConfig {
        min_handle: 1_000,
        max_handle: 1_001,
        ..WorldConfig::default()
    });

    let a = world.create(Context::World).unwrap();
    let b = world.create(Context::World).unwrap();
    assert_eq!(a.0, 1_000);
    assert_eq!(b.0, 1_001);
    assert!(world.create(Context::World).is_err());
}
