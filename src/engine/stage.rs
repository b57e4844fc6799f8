//! # Stages
//!
//! A stage is a mutation buffer: the place structural changes land while
//! the main stage is locked for iteration.
//!
//! ## Populations
//! - **Main stage (id 0).** Canonical. Its entity index and table arena are
//!   the authoritative world state.
//! - **Temp stage.** Attached to the world and used while single-threaded
//!   iteration is in progress.
//! - **Worker stages (id >= 1 + the temp slot).** One per worker thread in
//!   multi-threaded iteration, each owned single-writer by its worker.
//!
//! ## Shadowing
//! A non-main stage shadows the main entity index: a lookup consults the
//! stage first and falls back to the main stage. Component data written
//! under a stage lives in *shadow tables* inside the stage's own arena,
//! keyed by the same canonical types through the stage's own trie. These
//! shadow rows are the stage's pending additions; the merge folds them back
//! into the canonical tables.
//!
//! ## Invariants
//! - Any entity has at most one shadow record across all non-main stages
//!   at a time.
//! - Records in a stage's index refer to tables of that same stage's arena.
//! - A cleared stage holds no entities and an arena with only its root
//!   table.

use crate::engine::component::ComponentRegistry;
use crate::engine::entity_index::EntityIndex;
use crate::engine::graph::Stores;
use crate::engine::type_trie::TypeTrie;
use crate::engine::types::{StageId, TableId};

/// One mutation buffer: shadow entity index, shadow table arena, and the
/// bookkeeping the merge needs.
pub struct Stage {
    /// Unique stage id. `0` is the main stage; merges apply ascending.
    pub id: StageId,

    /// Shadow entity index. Non-main stages keep tombstones so the merge
    /// can observe deletions.
    pub entity_index: EntityIndex,

    /// Stage-local type interning. Handles are only meaningful within this
    /// stage; the merge re-interns against the main trie.
    pub trie: TypeTrie,

    /// Stage-local table arena holding shadow tables and tables first
    /// observed under this stage.
    pub stores: Stores,

    /// Main-stage tables whose membership may have changed; drained by the
    /// merge to repair query caches.
    pub dirty_tables: Vec<TableId>,

    /// Reject ids outside the world's handle range.
    pub range_check_enabled: bool,
}

impl Stage {
    /// Creates a stage. Non-main stages keep deletion tombstones and mark
    /// their tables as staged.
    pub fn new(id: StageId, registry: &ComponentRegistry) -> Self {
        let staged = id != 0;
        let trie = TypeTrie::new();
        let stores = Stores::new(&trie, registry, staged);
        Stage {
            id,
            entity_index: EntityIndex::new(staged),
            trie,
            stores,
            dirty_tables: Vec::new(),
            range_check_enabled: false,
        }
    }

    /// Returns `true` if the stage buffered no mutations.
    pub fn is_unused(&self) -> bool {
        self.entity_index.count() == 0
            && self.entity_index.iterate().next().is_none()
            && self.stores.tables.len() == 1
    }

    /// Drops all buffered state, returning the stage to its initial shape.
    ///
    /// Ran after a merge so the next frame starts from a clean buffer.
    pub fn clear(&mut self, registry: &ComponentRegistry) {
        self.entity_index.clear();
        self.trie = TypeTrie::new();
        self.stores = Stores::new(&self.trie, registry, self.id != 0);
        self.dirty_tables.clear();
    }
}
