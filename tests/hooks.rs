use std::sync::atomic::{AtomicUsize, Ordering};

use staged_ecs::{ComponentHooks, Context, Entity, World};

const COUNTER: Entity = Entity(10);

// Tests run concurrently in one process, so every test observes its own
// counter through its own hook function.
static INITS: AtomicUsize = AtomicUsize::new(0);
static FINIS_ON_DESTROY: AtomicUsize = AtomicUsize::new(0);
static FINIS_ON_REMOVE: AtomicUsize = AtomicUsize::new(0);
static REPLACES: AtomicUsize = AtomicUsize::new(0);
static MERGES: AtomicUsize = AtomicUsize::new(0);

fn init_hook(bytes: &mut [u8]) {
    INITS.fetch_add(1, Ordering::SeqCst);
    bytes.copy_from_slice(&100u32.to_le_bytes());
}

fn fini_on_destroy(_bytes: &mut [u8]) {
    FINIS_ON_DESTROY.fetch_add(1, Ordering::SeqCst);
}

fn fini_on_remove(_bytes: &mut [u8]) {
    FINIS_ON_REMOVE.fetch_add(1, Ordering::SeqCst);
}

fn replace_hook(current: &mut [u8], incoming: &[u8]) {
    REPLACES.fetch_add(1, Ordering::SeqCst);
    current.copy_from_slice(incoming);
}

// Additive merge: staged values accumulate instead of overwriting.
fn merge_hook(current: &mut [u8], staged: &[u8]) {
    MERGES.fetch_add(1, Ordering::SeqCst);
    let a = u32::from_le_bytes((&*current).try_into().unwrap());
    let b = u32::from_le_bytes(staged.try_into().unwrap());
    current.copy_from_slice(&(a + b).to_le_bytes());
}

fn setup(hooks: ComponentHooks) -> World {
    let mut world = World::new();
    world.register_component(COUNTER, 4, 4).unwrap();
    world.set_component_hooks(COUNTER, hooks).unwrap();
    world
}

#[test]
fn init_runs_on_fresh_rows_and_fini_on_destroyed_ones() {
    let mut world = setup(ComponentHooks {
        init: Some(init_hook),
        fini: Some(fini_on_destroy),
        ..ComponentHooks::default()
    });

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, COUNTER).unwrap();
    assert_eq!(INITS.load(Ordering::SeqCst), 1);
    assert_eq!(world.get_component(e, COUNTER).unwrap(), &100u32.to_le_bytes());

    world.destroy(Context::World, e).unwrap();
    assert_eq!(FINIS_ON_DESTROY.load(Ordering::SeqCst), 1);
}

#[test]
fn fini_runs_when_a_component_is_removed() {
    let mut world = setup(ComponentHooks {
        fini: Some(fini_on_remove),
        ..ComponentHooks::default()
    });

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, COUNTER).unwrap();

    world.remove_component(Context::World, e, COUNTER).unwrap();
    assert_eq!(FINIS_ON_REMOVE.load(Ordering::SeqCst), 1);
}

#[test]
fn replace_intercepts_overwrites_of_existing_values() {
    let mut world = setup(ComponentHooks {
        replace: Some(replace_hook),
        ..ComponentHooks::default()
    });

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, COUNTER).unwrap();

    world
        .set_component(Context::World, e, COUNTER, &5u32.to_le_bytes())
        .unwrap();
    assert_eq!(REPLACES.load(Ordering::SeqCst), 1);
    assert_eq!(world.get_component(e, COUNTER).unwrap(), &5u32.to_le_bytes());
}

#[test]
fn merge_hook_combines_staged_and_main_values() {
    let mut world = setup(ComponentHooks {
        merge: Some(merge_hook),
        ..ComponentHooks::default()
    });

    let e = world.create(Context::World).unwrap();
    world
        .set_component(Context::World, e, COUNTER, &40u32.to_le_bytes())
        .unwrap();

    world.begin_progress();
    world
        .set_component(Context::World, e, COUNTER, &2u32.to_le_bytes())
        .unwrap();
    world.end_progress().unwrap();

    assert!(MERGES.load(Ordering::SeqCst) > 0);
    // The staged value 2 folds over the main value 40 through the hook.
    assert_eq!(world.get_component(e, COUNTER).unwrap(), &42u32.to_le_bytes());
}

#[test]
fn raw_byte_components_need_no_hooks() {
    let mut world = World::new();
    world.register_component(COUNTER, 4, 4).unwrap();

    let e = world.create(Context::World).unwrap();
    world.add_component(Context::World, e, COUNTER).unwrap();
    // Zero-initialised without an init hook.
    assert_eq!(world.get_component(e, COUNTER).unwrap(), &0u32.to_le_bytes());
}
