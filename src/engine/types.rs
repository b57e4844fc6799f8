//! Core identifiers, capacity constants, and bit-level layouts.
//!
//! This module defines the **fundamental types and numeric limits** shared by
//! every subsystem of the storage core: entity handles, table and stage
//! identifiers, the packed row encoding used by entity records, and the
//! table flag bitset.
//!
//! ## Design Philosophy
//!
//! The storage core is built around:
//!
//! - **Opaque 64-bit entity handles** drawn from a monotonic counter,
//! - **Dense/sparse splits** keyed on small numeric thresholds,
//! - **Stable arena indices** instead of owning pointers,
//! - **Bit-packed metadata** on hot structures.
//!
//! ## Entity Representation
//!
//! An entity is a plain `u64`. Id `0` is the reserved "none" value. Ids below
//! [`HI_COMPONENT_ID`] name component types; everything at or above it is a
//! regular entity. The threshold also divides storage strategy: per-component
//! arrays and table edges are dense below it and map-backed above it.
//!
//! ## Packed Rows
//!
//! Entity records store their row as a packed value where the high bit is the
//! *watched* flag and the remaining bits hold `row + 1`. A stored value of
//! zero (ignoring the flag) means the entity has no row at all, which is the
//! case for entities with an empty type.
//!
//! All constants and encodings here are validated by static assertions or by
//! the test suite; the rest of the engine assumes they hold.

/// Raw numeric value of an entity handle.
pub type EntityId = u64;

/// Index of a table in a stage's table arena.
pub type TableId = u32;

/// Identifier of a mutation stage. `0` is the main stage.
pub type StageId = i32;

/// Identifier of a registered query.
pub type QueryId = u32;

/// Entity ids below this value name component types. Edges and per-component
/// arrays for these ids are stored densely; higher ids fall back to maps.
pub const HI_COMPONENT_ID: EntityId = 256;

/// Entity ids below this value are kept in the sparse half of the entity
/// index; higher ids are kept in a map to bound memory usage.
pub const HI_ENTITY_ID: EntityId = 100_000;

/// Maximum number of entity ids in a single type. Types are small by
/// construction; this bound catches runaway component sets early and lets
/// transition code use fixed-size scratch buffers.
pub const MAX_ENTITIES_IN_TYPE: usize = 256;

/// Maximum child offset stored densely in a type trie node. Offsets at or
/// beyond this value route the lookup through the bucketed map.
pub const MAX_CHILD_NODES: EntityId = 256;

/// Number of hash buckets in the sparse half of a trie node.
pub const TYPE_BUCKET_COUNT: usize = 256;

/// Capacity of one worker's bounded job queue.
pub const MAX_JOBS_PER_WORKER: usize = 16;

const _: [(); 1] = [(); (HI_COMPONENT_ID <= HI_ENTITY_ID) as usize];

/// Opaque handle to an entity.
///
/// ## Notes
/// `Entity` values are cheap to copy and compare. The handle itself carries
/// no liveness information; the entity index is the authority on whether a
/// handle refers to a live entity.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Entity(pub EntityId);

impl Entity {
    /// The reserved "no entity" handle.
    pub const NONE: Entity = Entity(0);

    /// Returns `true` if this handle is the reserved none value.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if this id names a component type.
    #[inline]
    pub fn is_component(self) -> bool {
        self.0 != 0 && self.0 < HI_COMPONENT_ID
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

const WATCHED_BIT: u32 = 1 << 31;
const ROW_MASK: u32 = WATCHED_BIT - 1;

/// Row of an entity within its table, packed together with the watched flag.
///
/// ## Encoding
/// Bit 31 carries the watched flag. The low 31 bits store `row + 1`, so a
/// stored value of zero means "no row": the entity exists but owns no column
/// data. The flag must survive every structural transition unchanged unless
/// explicitly toggled.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PackedRow(u32);

impl PackedRow {
    /// A row encoding for an entity that occupies no table row.
    pub const EMPTY: PackedRow = PackedRow(0);

    /// Packs a concrete row index.
    #[inline]
    pub fn at(row: usize) -> Self {
        debug_assert!((row as u32) < ROW_MASK);
        PackedRow(row as u32 + 1)
    }

    /// Returns the row index, or `None` if the entity has no row.
    #[inline]
    pub fn row(self) -> Option<usize> {
        let bits = self.0 & ROW_MASK;
        if bits == 0 {
            None
        } else {
            Some(bits as usize - 1)
        }
    }

    /// Returns the watched flag.
    #[inline]
    pub fn is_watched(self) -> bool {
        self.0 & WATCHED_BIT != 0
    }

    /// Returns a copy with the watched flag set to `watched`.
    #[inline]
    pub fn with_watched(self, watched: bool) -> Self {
        if watched {
            PackedRow(self.0 | WATCHED_BIT)
        } else {
            PackedRow(self.0 & !WATCHED_BIT)
        }
    }

    /// Returns a copy pointing at `row`, preserving the watched flag.
    #[inline]
    pub fn moved_to(self, row: usize) -> Self {
        PackedRow::at(row).with_watched(self.is_watched())
    }

    /// Returns a copy with no row, preserving the watched flag.
    #[inline]
    pub fn cleared(self) -> Self {
        PackedRow::EMPTY.with_watched(self.is_watched())
    }
}

/// Property flags attached to a table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TableFlags(u32);

impl TableFlags {
    /// Table lives in a non-main stage arena.
    pub const STAGED: TableFlags = TableFlags(1);
    /// Table stores prefab entities.
    pub const IS_PREFAB: TableFlags = TableFlags(2);
    /// Table type references a prefab.
    pub const HAS_PREFAB: TableFlags = TableFlags(4);
    /// Table type references builtin component ids.
    pub const HAS_BUILTINS: TableFlags = TableFlags(8);

    /// Returns `true` if all bits of `other` are set.
    #[inline]
    pub fn contains(self, other: TableFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets all bits of `other`.
    #[inline]
    pub fn insert(&mut self, other: TableFlags) {
        self.0 |= other.0;
    }

    /// Clears all bits of `other`.
    #[inline]
    pub fn remove(&mut self, other: TableFlags) {
        self.0 &= !other.0;
    }
}
