#![allow(dead_code)]

use staged_ecs::{Context, Entity, SigColumn, Signature, World};

pub const ENTITIES_SMALL: usize = 10_000;
pub const ENTITIES_MED: usize = 100_000;

pub const POSITION: Entity = Entity(10);
pub const VELOCITY: Entity = Entity(11);
pub const MASS: Entity = Entity(12);

pub fn make_world() -> World {
    let mut world = World::new();
    world.register_component(POSITION, 16, 8).unwrap();
    world.register_component(VELOCITY, 16, 8).unwrap();
    world.register_component(MASS, 4, 4).unwrap();
    world
}

pub fn populate(world: &mut World, count: usize) -> Vec<Entity> {
    let mut entities = Vec::with_capacity(count);
    for i in 0..count {
        let e = world.create(Context::World).unwrap();
        world
            .set_component(Context::World, e, POSITION, &[0u8; 16])
            .unwrap();
        world
            .set_component(Context::World, e, VELOCITY, &[1u8; 16])
            .unwrap();
        if i % 2 == 0 {
            world
                .set_component(Context::World, e, MASS, &(i as u32).to_le_bytes())
                .unwrap();
        }
        entities.push(e);
    }
    entities
}

pub fn movement_signature() -> Signature {
    Signature::new(vec![
        SigColumn::read(POSITION),
        SigColumn::read(VELOCITY),
    ])
}
