//! # Type Graph
//!
//! Table arena plus the add/remove edge lattice connecting tables that
//! differ by a single id.
//!
//! ## Purpose
//! Structural transitions are frequent and repetitive: the same `(table,
//! id)` pairs come up over and over. The graph amortises table resolution by
//! caching, per source table and id, the destination of adding or removing
//! that id. A cache hit is a pointer chase; only structural novelty pays for
//! a trie walk and table construction.
//!
//! ## Design
//! - Tables live in an arena with stable indices; edges store indices.
//! - The arena also keeps a type-to-table map so the same type never
//!   produces two tables within one stage.
//! - Newly created tables are recorded in `new_tables` until the owner
//!   drains them, which is how query matching learns about them.
//!
//! ## Tie-breaks
//! Adding an id a table already has yields the table itself, as does
//! removing an id it lacks. Both results are cached like any other edge.

use fxhash::FxHashMap;
use tracing::trace;

use crate::engine::component::ComponentRegistry;
use crate::engine::error::{internal, EcsResult};
use crate::engine::table::Table;
use crate::engine::type_trie::{TypeHandle, TypeTrie};
use crate::engine::types::{Entity, TableFlags, TableId};

/// Table arena of one stage, with the type lookup map and edge machinery.
pub struct Stores {
    /// All tables of the stage. Index 0 is the root table (empty type).
    pub tables: Vec<Table>,

    /// Interned type to table.
    pub table_index: FxHashMap<TypeHandle, TableId>,

    /// Tables created since the owner last drained this list.
    pub new_tables: Vec<TableId>,

    /// Tables created here are marked staged.
    staged: bool,
}

impl Stores {
    /// Creates an arena holding only the root table.
    pub fn new(trie: &TypeTrie, registry: &ComponentRegistry, staged: bool) -> Self {
        let mut root = Table::new(0, TypeHandle::EMPTY, trie.type_of(TypeHandle::EMPTY), registry)
            .expect("the empty type has no components to reject");
        if staged {
            root.flags.insert(TableFlags::STAGED);
        }
        let mut table_index = FxHashMap::default();
        table_index.insert(TypeHandle::EMPTY, 0);
        Stores {
            tables: vec![root],
            table_index,
            new_tables: Vec::new(),
            staged,
        }
    }

    /// The root table.
    #[inline]
    pub fn root(&self) -> &Table {
        &self.tables[0]
    }

    /// Borrows a table by id.
    #[inline]
    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id as usize]
    }

    /// Mutably borrows a table by id.
    #[inline]
    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id as usize]
    }

    /// Mutably borrows two distinct tables at once.
    pub fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        assert!(a != b, "source and destination table must differ");
        let (a, b, flipped) = if a < b { (a, b, false) } else { (b, a, true) };
        let (head, tail) = self.tables.split_at_mut(b as usize);
        let first = &mut head[a as usize];
        let second = &mut tail[0];
        if flipped {
            (second, first)
        } else {
            (first, second)
        }
    }

    /// Finds the table for an interned type, creating it on first demand.
    pub fn table_for_type(
        &mut self,
        trie: &TypeTrie,
        registry: &ComponentRegistry,
        handle: TypeHandle,
    ) -> EcsResult<TableId> {
        if let Some(&id) = self.table_index.get(&handle) {
            return Ok(id);
        }

        let id = self.tables.len() as TableId;
        let mut table = Table::new(id, handle, trie.type_of(handle), registry)?;
        if self.staged {
            table.flags.insert(TableFlags::STAGED);
        }
        trace!(table = id, ids = ?table.type_ids, "table created");
        self.tables.push(table);
        self.table_index.insert(handle, id);
        self.new_tables.push(id);
        Ok(id)
    }

    /// Resolves the table whose type is `table`'s type plus `id`.
    ///
    /// ## Behavior
    /// 1. Consult the cached edge; a hit returns immediately.
    /// 2. On a miss, intern the destination type, find or create its table,
    ///    and cache the edge in both directions.
    ///
    /// Adding an id the type already contains resolves to the table itself.
    pub fn find_or_create_add(
        &mut self,
        trie: &mut TypeTrie,
        registry: &ComponentRegistry,
        table: TableId,
        id: Entity,
    ) -> EcsResult<TableId> {
        if let Some(to) = self.table(table).edge(id).add {
            return Ok(to);
        }

        let src = self.table(table);
        let dst = if src.has(id) {
            table
        } else {
            let handle = trie.with_added(src.ty, id)?;
            self.table_for_type(trie, registry, handle)?
        };

        self.table_mut(table).set_add_edge(id, dst);
        if dst != table {
            self.table_mut(dst).set_remove_edge(id, table);
        }
        Ok(dst)
    }

    /// Resolves the table whose type is `table`'s type minus `id`.
    ///
    /// Removing an id the type lacks resolves to the table itself.
    pub fn find_or_create_remove(
        &mut self,
        trie: &mut TypeTrie,
        registry: &ComponentRegistry,
        table: TableId,
        id: Entity,
    ) -> EcsResult<TableId> {
        if let Some(to) = self.table(table).edge(id).remove {
            return Ok(to);
        }

        let src = self.table(table);
        let dst = if !src.has(id) {
            table
        } else {
            let handle = trie.with_removed(src.ty, id)?;
            self.table_for_type(trie, registry, handle)?
        };

        self.table_mut(table).set_remove_edge(id, dst);
        if dst != table {
            self.table_mut(dst).set_add_edge(id, table);
        }
        Ok(dst)
    }

    /// Sanity check used by merge: the arena and the type map must agree.
    pub fn check_index(&self) -> EcsResult<()> {
        if self.table_index.len() != self.tables.len() {
            return Err(internal("table arena and type map out of sync"));
        }
        Ok(())
    }
}
