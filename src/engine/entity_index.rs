//! # Entity Index
//!
//! Bidirectional mapping between entity handles and the `(table, row)`
//! records that locate their component data.
//!
//! ## Purpose
//! Every live entity has exactly one record per stage that knows it. The
//! record names the table holding the entity's components and the packed row
//! within that table (see [`PackedRow`]). The index is the authority on
//! entity liveness.
//!
//! ## Layout
//! The index is a hybrid of two substructures split at [`HI_ENTITY_ID`]:
//!
//! - `lo` — a sparse set (sparse page array + dense record array) for ids
//!   below the threshold. Lookup is two array reads.
//! - `hi` — a hash map for ids at or above the threshold, trading lookup
//!   cost for memory.
//!
//! Lookups consult `lo` first and fall back to `hi`.
//!
//! ## Generations
//! Each `lo` slot carries a generation counter bumped on removal. Stale
//! internal references compare their captured generation before trusting a
//! record, so id reuse can never resurrect an old record. The `hi` map
//! stores its generation inline per entry.
//!
//! ## Tombstones
//! When constructed with `keep_deletes`, removal inserts a tombstone instead
//! of erasing the entry. Stage indices use this so a merge can observe
//! deletions that were applied while iterating.
//!
//! ## Invariants
//! - A record's `(table, row)` points back at the entity that owns it.
//! - An entity appears in at most one of `lo` / `hi`, decided by its id.
//! - Tombstones only exist when `keep_deletes` is set.

use fxhash::FxHashMap;

use crate::engine::types::{Entity, EntityId, PackedRow, TableId, HI_ENTITY_ID};

/// Location of a live entity: the table holding its components and the
/// packed row within that table.
///
/// ## Notes
/// `table` is an arena index interpreted relative to the stage that owns the
/// record. The root table of a stage has index `0`; an entity with an empty
/// type has `table = 0` and no row.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Record {
    /// Table holding the entity's components.
    pub table: TableId,

    /// Packed row and watched flag.
    pub row: PackedRow,
}

/// State of an entity index entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordState {
    /// Entity is live at the given record.
    Alive(Record),

    /// Entity was removed while `keep_deletes` was set.
    Deleted,
}

/// Opaque back-reference from a table row to the entity index entry that
/// owns it. Rehydrated through the index on demand; never a pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecordRef {
    /// Entity whose record this reference resolves to.
    pub entity: Entity,

    /// Generation captured when the reference was created.
    pub generation: u32,
}

#[derive(Clone, Copy, Debug)]
struct LoSlot {
    generation: u32,
    dense: u32,
    occupied: bool,
}

impl Default for LoSlot {
    fn default() -> Self {
        LoSlot {
            generation: 0,
            dense: 0,
            occupied: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum HiState {
    Alive(Record),
    Tombstone,
    Vacant,
}

#[derive(Clone, Copy, Debug)]
struct HiSlot {
    generation: u32,
    state: HiState,
}

/// Hybrid sparse-set/map index from entity id to [`RecordState`].
#[derive(Clone, Debug, Default)]
pub struct EntityIndex {
    sparse: Vec<LoSlot>,
    dense: Vec<Entity>,
    lo_records: Vec<RecordState>,
    hi: FxHashMap<EntityId, HiSlot>,
    keep_deletes: bool,
    alive: usize,
}

impl EntityIndex {
    /// Creates an empty index.
    ///
    /// With `keep_deletes`, removals leave a tombstone entry behind instead
    /// of erasing the record. Stage-local indices need this so the merge can
    /// replay deletions against the main stage.
    pub fn new(keep_deletes: bool) -> Self {
        EntityIndex {
            sparse: Vec::new(),
            dense: Vec::new(),
            lo_records: Vec::new(),
            hi: FxHashMap::default(),
            keep_deletes,
            alive: 0,
        }
    }

    /// Number of live entities in the index. Tombstones do not count.
    #[inline]
    pub fn count(&self) -> usize {
        self.alive
    }

    /// Returns the record of a live entity, skipping tombstones.
    pub fn get(&self, entity: Entity) -> Option<Record> {
        match self.state(entity) {
            Some(RecordState::Alive(record)) => Some(record),
            _ => None,
        }
    }

    /// Returns the raw entry state, including tombstones.
    pub fn state(&self, entity: Entity) -> Option<RecordState> {
        if entity.0 < HI_ENTITY_ID {
            let slot = self.sparse.get(entity.0 as usize)?;
            if !slot.occupied {
                return None;
            }
            Some(self.lo_records[slot.dense as usize])
        } else {
            match self.hi.get(&entity.0)?.state {
                HiState::Alive(record) => Some(RecordState::Alive(record)),
                HiState::Tombstone => Some(RecordState::Deleted),
                HiState::Vacant => None,
            }
        }
    }

    /// Returns the current generation of an entity's slot.
    ///
    /// The generation is bumped every time the entity is removed, so a
    /// [`RecordRef`] captured before a removal no longer resolves.
    pub fn generation(&self, entity: Entity) -> u32 {
        if entity.0 < HI_ENTITY_ID {
            self.sparse
                .get(entity.0 as usize)
                .map(|slot| slot.generation)
                .unwrap_or(0)
        } else {
            self.hi
                .get(&entity.0)
                .map(|slot| slot.generation)
                .unwrap_or(0)
        }
    }

    /// Creates a back-reference to the entity's current record.
    pub fn make_ref(&self, entity: Entity) -> RecordRef {
        RecordRef {
            entity,
            generation: self.generation(entity),
        }
    }

    /// Resolves a back-reference, returning `None` if the referenced record
    /// was removed since the reference was created.
    pub fn resolve(&self, record_ref: RecordRef) -> Option<Record> {
        if self.generation(record_ref.entity) != record_ref.generation {
            return None;
        }
        self.get(record_ref.entity)
    }

    /// Inserts or overwrites the record for `entity`.
    pub fn set(&mut self, entity: Entity, record: Record) {
        debug_assert!(!entity.is_none(), "cannot index the none entity");
        if entity.0 < HI_ENTITY_ID {
            self.ensure_sparse(entity.0 as usize);
            let slot = &mut self.sparse[entity.0 as usize];
            if slot.occupied {
                let dense = slot.dense as usize;
                if matches!(self.lo_records[dense], RecordState::Deleted) {
                    self.alive += 1;
                }
                self.lo_records[dense] = RecordState::Alive(record);
            } else {
                slot.occupied = true;
                slot.dense = self.dense.len() as u32;
                self.dense.push(entity);
                self.lo_records.push(RecordState::Alive(record));
                self.alive += 1;
            }
        } else {
            let entry = self.hi.entry(entity.0).or_insert(HiSlot {
                generation: 0,
                state: HiState::Vacant,
            });
            if !matches!(entry.state, HiState::Alive(_)) {
                self.alive += 1;
            }
            entry.state = HiState::Alive(record);
        }
    }

    /// Returns a mutable record for `entity`, inserting an empty one if the
    /// entity is absent or tombstoned.
    pub fn get_or_create(&mut self, entity: Entity) -> &mut Record {
        if self.get(entity).is_none() {
            self.set(entity, Record::default());
        }
        if entity.0 < HI_ENTITY_ID {
            let dense = self.sparse[entity.0 as usize].dense as usize;
            match &mut self.lo_records[dense] {
                RecordState::Alive(record) => record,
                RecordState::Deleted => unreachable!("set() revived the entry"),
            }
        } else {
            match &mut self.hi.get_mut(&entity.0).expect("set() inserted").state {
                HiState::Alive(record) => record,
                _ => unreachable!("set() revived the entry"),
            }
        }
    }

    /// Removes `entity` from the index.
    ///
    /// ## Behavior
    /// - Bumps the slot generation so stale references stop resolving.
    /// - With `keep_deletes`, replaces the record with a tombstone that
    ///   [`iterate`](Self::iterate) still visits.
    /// - Without it, erases the entry entirely.
    ///
    /// Returns the removed record, if the entity was live.
    pub fn remove(&mut self, entity: Entity) -> Option<Record> {
        if entity.0 < HI_ENTITY_ID {
            let slot = self.sparse.get_mut(entity.0 as usize)?;
            if !slot.occupied {
                return None;
            }
            slot.generation = slot.generation.wrapping_add(1);
            let dense = slot.dense as usize;
            let removed = match self.lo_records[dense] {
                RecordState::Alive(record) => record,
                RecordState::Deleted => return None,
            };
            self.alive -= 1;
            if self.keep_deletes {
                self.lo_records[dense] = RecordState::Deleted;
            } else {
                slot.occupied = false;
                self.dense.swap_remove(dense);
                self.lo_records.swap_remove(dense);
                if dense < self.dense.len() {
                    let moved = self.dense[dense];
                    self.sparse[moved.0 as usize].dense = dense as u32;
                }
            }
            Some(removed)
        } else {
            let keep_deletes = self.keep_deletes;
            let slot = self.hi.get_mut(&entity.0)?;
            let removed = match slot.state {
                HiState::Alive(record) => record,
                _ => return None,
            };
            self.alive -= 1;
            slot.generation = slot.generation.wrapping_add(1);
            // Vacant entries are kept so the generation survives id reuse.
            slot.state = if keep_deletes {
                HiState::Tombstone
            } else {
                HiState::Vacant
            };
            Some(removed)
        }
    }

    /// Iterates all entries, tombstones included, in a stable order.
    ///
    /// Low ids come first in dense-insertion order, followed by high ids.
    /// The order is stable as long as the index is not mutated.
    pub fn iterate(&self) -> impl Iterator<Item = (Entity, RecordState)> + '_ {
        let lo = self
            .dense
            .iter()
            .zip(self.lo_records.iter())
            .map(|(&entity, &state)| (entity, state));
        let hi = self.hi.iter().filter_map(|(&id, slot)| match slot.state {
            HiState::Alive(record) => Some((Entity(id), RecordState::Alive(record))),
            HiState::Tombstone => Some((Entity(id), RecordState::Deleted)),
            HiState::Vacant => None,
        });
        lo.chain(hi)
    }

    /// Drops all entries and tombstones. Generations are reset; callers must
    /// not resolve references captured before the clear.
    pub fn clear(&mut self) {
        self.sparse.clear();
        self.dense.clear();
        self.lo_records.clear();
        self.hi.clear();
        self.alive = 0;
    }

    fn ensure_sparse(&mut self, id: usize) {
        if self.sparse.len() <= id {
            self.sparse.resize(id + 1, LoSlot::default());
        }
    }
}
