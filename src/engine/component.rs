//! # Component Registry
//!
//! This module maps component ids to the metadata the storage layer needs to
//! allocate, copy, and destroy component values: byte size, alignment, and
//! an optional set of lifecycle hooks.
//!
//! ## Purpose
//! Components are entities whose id falls below `HI_COMPONENT_ID`. The
//! registry decouples that id space from storage: tables only ever see byte
//! sizes and hook function pointers, never concrete Rust types. Copying and
//! moving component values is byte-level by default.
//!
//! ## Design
//! - The registry is owned by its world; there is no process-global state.
//! - Metadata is stored in a dense array indexed by component id, so lookup
//!   on the hot transition path is one bounds check and one array read.
//! - Registration is idempotent: re-registering an id with the same layout
//!   succeeds, a conflicting layout is rejected.
//!
//! ## Lifecycle hooks
//! Hooks are plain function pointers over raw byte slices. Absence of a hook
//! implies raw-byte semantics:
//!
//! - `init` — invoked on freshly reserved rows; default is zero-fill.
//! - `fini` — invoked on rows about to be discarded; default is nothing.
//! - `replace` — invoked before an explicit overwrite of an existing value.
//! - `merge` — invoked when a staged value is folded over a main-stage
//!   value; default is a plain copy.

use crate::engine::error::{EcsError, EcsResult};
use crate::engine::types::{Entity, HI_COMPONENT_ID};

/// Builtin component describing a registered component's layout. Entities
/// that name components carry this, which is what marks their tables as
/// builtin storage.
pub const COMPONENT: Entity = Entity(1);

/// Builtin tag marking an entity as a prefab template.
pub const PREFAB: Entity = Entity(2);

/// Builtin tag marking an entity as a container (it has children).
pub const CONTAINER: Entity = Entity(3);

/// First component id available to applications; lower ids are reserved for
/// the builtins above.
pub const FIRST_USER_COMPONENT: Entity = Entity(4);

/// Byte layout of the [`COMPONENT`] builtin's value: the described
/// component's size and alignment as two little-endian `u64`s.
pub const COMPONENT_VALUE_SIZE: usize = 16;

/// Encodes a component layout into [`COMPONENT`] value bytes.
pub fn encode_component_value(size: usize, align: usize) -> [u8; COMPONENT_VALUE_SIZE] {
    let mut bytes = [0u8; COMPONENT_VALUE_SIZE];
    bytes[..8].copy_from_slice(&(size as u64).to_le_bytes());
    bytes[8..].copy_from_slice(&(align as u64).to_le_bytes());
    bytes
}

/// Hook invoked on a freshly reserved, zero-filled row.
pub type InitHook = fn(&mut [u8]);

/// Hook invoked on a row that is about to be discarded.
pub type FiniHook = fn(&mut [u8]);

/// Hook invoked before an existing value (`current`) is overwritten by an
/// incoming value (`incoming`).
pub type ReplaceHook = fn(current: &mut [u8], incoming: &[u8]);

/// Hook invoked when a staged value (`staged`) is merged over the main-stage
/// value (`current`). The hook is responsible for writing the final value
/// into `current`.
pub type MergeHook = fn(current: &mut [u8], staged: &[u8]);

/// Optional per-component lifecycle callbacks.
#[derive(Clone, Copy, Default)]
pub struct ComponentHooks {
    /// Value construction for new rows.
    pub init: Option<InitHook>,

    /// Value destruction for discarded rows.
    pub fini: Option<FiniHook>,

    /// Overwrite interception for `set` operations.
    pub replace: Option<ReplaceHook>,

    /// Stage-merge combination.
    pub merge: Option<MergeHook>,
}

impl std::fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("init", &self.init.is_some())
            .field("fini", &self.fini.is_some())
            .field("replace", &self.replace.is_some())
            .field("merge", &self.merge.is_some())
            .finish()
    }
}

/// Layout and hooks of one registered component.
#[derive(Clone, Copy, Debug)]
pub struct ComponentInfo {
    /// Component id.
    pub id: Entity,

    /// Value size in bytes. Zero marks a tag component.
    pub size: usize,

    /// Value alignment in bytes.
    pub align: usize,

    /// Lifecycle hooks; all optional.
    pub hooks: ComponentHooks,
}

/// World-owned table of component metadata indexed by component id.
///
/// ## Invariants
/// - `infos[id]` is `Some` if and only if component `id` is registered.
/// - Registered layouts never change for the lifetime of the world.
pub struct ComponentRegistry {
    infos: Vec<Option<ComponentInfo>>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ComponentRegistry {
            infos: (0..HI_COMPONENT_ID as usize).map(|_| None).collect(),
        }
    }

    /// Registers component `id` with the given layout.
    ///
    /// ## Behavior
    /// - Ids must be component ids (non-zero, below the component threshold).
    /// - Registering the same id twice with an identical layout is a no-op.
    /// - `align` must be a power of two that divides into a valid layout
    ///   with `size`; tags register with `size == 0`.
    ///
    /// ## Errors
    /// `UnknownComponent` when the id is out of the component range or the
    /// layout conflicts with an earlier registration.
    pub fn register(&mut self, id: Entity, size: usize, align: usize) -> EcsResult<()> {
        if !id.is_component() {
            return Err(EcsError::UnknownComponent(id));
        }
        if size != 0 && (align == 0 || !align.is_power_of_two()) {
            return Err(EcsError::UnknownComponent(id));
        }

        let slot = &mut self.infos[id.0 as usize];
        match slot {
            Some(existing) if existing.size != size || existing.align != align => {
                Err(EcsError::UnknownComponent(id))
            }
            Some(_) => Ok(()),
            None => {
                *slot = Some(ComponentInfo {
                    id,
                    size,
                    align: align.max(1),
                    hooks: ComponentHooks::default(),
                });
                Ok(())
            }
        }
    }

    /// Installs lifecycle hooks for a registered component.
    pub fn set_hooks(&mut self, id: Entity, hooks: ComponentHooks) -> EcsResult<()> {
        match self.infos.get_mut(id.0 as usize).and_then(|s| s.as_mut()) {
            Some(info) => {
                info.hooks = hooks;
                Ok(())
            }
            None => Err(EcsError::UnknownComponent(id)),
        }
    }

    /// Returns the metadata of a registered component.
    #[inline]
    pub fn info(&self, id: Entity) -> Option<&ComponentInfo> {
        self.infos.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    /// Returns the metadata of a registered component or fails.
    #[inline]
    pub fn require(&self, id: Entity) -> EcsResult<&ComponentInfo> {
        self.info(id).ok_or(EcsError::UnknownComponent(id))
    }

    /// Returns `true` if `id` is a registered component.
    #[inline]
    pub fn is_registered(&self, id: Entity) -> bool {
        self.info(id).is_some()
    }

    /// Byte size used for column allocation of an arbitrary type id.
    ///
    /// Registered components report their value size; plain entity ids
    /// embedded in a type (prefabs, containers) occupy no column bytes.
    #[inline]
    pub fn column_size(&self, id: Entity) -> usize {
        self.info(id).map(|info| info.size).unwrap_or(0)
    }
}
