//! # Archetype Tables
//!
//! Column-major storage for all entities that share the exact same type.
//!
//! ## Purpose
//! A table owns one [`Column`] per id in its type, all kept row-aligned with
//! the entity array. Entities are densely packed with swap-remove semantics,
//! and a parallel array of index back-references makes row repairs O(1)
//! after a swap.
//!
//! ## Design
//! - Component data is stored column-major by type id.
//! - Tag components and plain entity ids (prefabs, containers) occupy a
//!   zero-sized column so positions still line up with the type.
//! - Transition edges to neighbouring tables are cached on the table itself:
//!   densely for component ids, in a map for higher ids.
//! - Cross-table moves match columns **by id**, never by position.
//!
//! ## Invariants
//! - `entities.len() == record_ptrs.len() == columns[i].len()` for every
//!   non-zero-sized column `i`.
//! - An add edge, once computed, points at the table whose type is this
//!   table's type plus the edge id; remove edges are symmetric.
//! - Tables are never destroyed during a run; edges hold arena indices.

use fxhash::FxHashMap;

use crate::engine::column::Column;
use crate::engine::component::ComponentRegistry;
use crate::engine::entity_index::RecordRef;
use crate::engine::error::{EcsError, EcsResult};
use crate::engine::type_trie::TypeHandle;
use crate::engine::types::{
    Entity, EntityId, QueryId, TableFlags, TableId, HI_COMPONENT_ID,
};

/// Cached transition to neighbouring tables for one id.
///
/// Absence of a direction means "not yet computed", never "does not exist".
#[derive(Clone, Copy, Debug, Default)]
pub struct Edge {
    /// Table whose type is this table's type plus the edge id.
    pub add: Option<TableId>,

    /// Table whose type is this table's type minus the edge id.
    pub remove: Option<TableId>,
}

/// Row-aligned storage of one table: entity ids, index back-references, and
/// component columns.
#[derive(Default)]
pub struct TableData {
    /// Entity per row.
    pub entities: Vec<Entity>,

    /// Back-reference to each entity's index record, parallel to `entities`.
    pub record_ptrs: Vec<RecordRef>,

    /// One column per type id, parallel to the table's type.
    pub columns: Vec<Column>,
}

/// Storage block for all entities of one exact type.
pub struct Table {
    /// Arena index of this table within its stage.
    pub id: TableId,

    /// Interned type identity.
    pub ty: TypeHandle,

    /// Canonical sorted ids of the type.
    pub type_ids: Box<[Entity]>,

    /// Row storage.
    pub data: TableData,

    /// Dense edges for component ids, indexed by id.
    lo_edges: Box<[Edge]>,

    /// Sparse edges for ids at or above the component threshold.
    hi_edges: FxHashMap<EntityId, Edge>,

    /// Property flags.
    pub flags: TableFlags,

    /// Queries whose cache currently holds this table.
    pub queries: Vec<QueryId>,

    /// Merge scratch: destination rows assigned while folding one stage.
    pub dst_rows: Vec<i32>,

    /// Number of container ids in the type.
    pub parent_count: i32,
}

impl Table {
    /// Creates an empty table for the given interned type.
    ///
    /// ## Errors
    /// `UnknownComponent` when a component id in the type has no registered
    /// layout. Plain entity ids (prefabs, containers) are allowed and get a
    /// zero-sized column.
    pub fn new(
        id: TableId,
        ty: TypeHandle,
        type_ids: &[Entity],
        registry: &ComponentRegistry,
    ) -> EcsResult<Self> {
        let mut columns = Vec::with_capacity(type_ids.len());
        for &type_id in type_ids {
            if type_id.is_component() && !registry.is_registered(type_id) {
                return Err(EcsError::UnknownComponent(type_id));
            }
            let (size, align) = registry
                .info(type_id)
                .map(|info| (info.size, info.align))
                .unwrap_or((0, 1));
            columns.push(Column::new(size, align));
        }

        Ok(Table {
            id,
            ty,
            type_ids: type_ids.to_vec().into_boxed_slice(),
            data: TableData {
                entities: Vec::new(),
                record_ptrs: Vec::new(),
                columns,
            },
            lo_edges: (0..HI_COMPONENT_ID).map(|_| Edge::default()).collect(),
            hi_edges: FxHashMap::default(),
            flags: TableFlags::default(),
            queries: Vec::new(),
            dst_rows: Vec::new(),
            parent_count: 0,
        })
    }

    /// Number of rows.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.entities.len()
    }

    /// Position of `id` within the type, if present.
    #[inline]
    pub fn column_index(&self, id: Entity) -> Option<usize> {
        self.type_ids.binary_search(&id).ok()
    }

    /// Returns `true` if the type contains `id`.
    #[inline]
    pub fn has(&self, id: Entity) -> bool {
        self.column_index(id).is_some()
    }

    /// Borrows the column of a contained id.
    #[inline]
    pub fn column(&self, id: Entity) -> Option<&Column> {
        self.column_index(id).map(|i| &self.data.columns[i])
    }

    /// Cached edge for `id`, if any direction was computed before.
    #[inline]
    pub fn edge(&self, id: Entity) -> Edge {
        if id.0 < HI_COMPONENT_ID {
            self.lo_edges[id.0 as usize]
        } else {
            self.hi_edges.get(&id.0).copied().unwrap_or_default()
        }
    }

    /// Caches the add direction of the edge for `id`.
    pub fn set_add_edge(&mut self, id: Entity, to: TableId) {
        if id.0 < HI_COMPONENT_ID {
            self.lo_edges[id.0 as usize].add = Some(to);
        } else {
            self.hi_edges.entry(id.0).or_default().add = Some(to);
        }
    }

    /// Caches the remove direction of the edge for `id`.
    pub fn set_remove_edge(&mut self, id: Entity, to: TableId) {
        if id.0 < HI_COMPONENT_ID {
            self.lo_edges[id.0 as usize].remove = Some(to);
        } else {
            self.hi_edges.entry(id.0).or_default().remove = Some(to);
        }
    }

    /// Reserves a new row for `entity` and returns its index.
    ///
    /// ## Behavior
    /// Component columns are zero-initialised unless the component registered
    /// an `init` hook, which then runs over the fresh bytes.
    pub fn append(
        &mut self,
        entity: Entity,
        record_ref: RecordRef,
        registry: &ComponentRegistry,
    ) -> usize {
        let row = self.data.entities.len();
        self.data.entities.push(entity);
        self.data.record_ptrs.push(record_ref);

        for (i, &type_id) in self.type_ids.iter().enumerate() {
            let column = &mut self.data.columns[i];
            let at = column.push_zeroed();
            debug_assert_eq!(at, row);
            if column.size() > 0 {
                if let Some(init) = registry.info(type_id).and_then(|info| info.hooks.init) {
                    init(column.row_mut(at));
                }
            }
        }
        row
    }

    /// Removes `row`, moving the last row into its place.
    ///
    /// ## Behavior
    /// - With `destruct`, each component's `fini` hook runs on the removed
    ///   values first.
    /// - Returns the entity that was moved into `row`, if any. The caller
    ///   must repair that entity's record; `record_ptrs` already holds the
    ///   reference needed to find it.
    pub fn swap_remove(
        &mut self,
        row: usize,
        registry: &ComponentRegistry,
        destruct: bool,
    ) -> Option<Entity> {
        debug_assert!(row < self.count());

        if destruct {
            for (i, &type_id) in self.type_ids.iter().enumerate() {
                let column = &mut self.data.columns[i];
                if column.size() == 0 {
                    continue;
                }
                if let Some(fini) = registry.info(type_id).and_then(|info| info.hooks.fini) {
                    fini(column.row_mut(row));
                }
            }
        }

        for column in &mut self.data.columns {
            column.swap_remove(row);
        }
        self.data.entities.swap_remove(row);
        self.data.record_ptrs.swap_remove(row);

        (row < self.data.entities.len()).then(|| self.data.entities[row])
    }

    /// Overwrites the value of `component` at `row` with `bytes`.
    ///
    /// The component's `replace` hook, if any, intercepts the overwrite;
    /// otherwise the bytes are copied in place.
    pub fn write_component(
        &mut self,
        row: usize,
        component: Entity,
        bytes: &[u8],
        registry: &ComponentRegistry,
    ) -> EcsResult<()> {
        let info = registry.require(component)?;
        if info.size != bytes.len() {
            return Err(EcsError::UnknownComponent(component));
        }
        let index = self
            .column_index(component)
            .ok_or(EcsError::UnknownComponent(component))?;
        let column = &mut self.data.columns[index];
        if info.size == 0 {
            return Ok(());
        }
        match info.hooks.replace {
            Some(replace) => replace(column.row_mut(row), bytes),
            None => column.write_row(row, bytes),
        }
        Ok(())
    }

    /// Folds a staged value of `component` over the current value at `row`.
    ///
    /// The component's `merge` hook, if any, combines the two; otherwise the
    /// staged bytes win outright.
    pub fn merge_component(
        &mut self,
        row: usize,
        component: Entity,
        staged: &[u8],
        registry: &ComponentRegistry,
    ) -> EcsResult<()> {
        let info = registry.require(component)?;
        let index = self
            .column_index(component)
            .ok_or(EcsError::UnknownComponent(component))?;
        let column = &mut self.data.columns[index];
        if info.size == 0 {
            return Ok(());
        }
        match info.hooks.merge {
            Some(merge) => merge(column.row_mut(row), staged),
            None => column.write_row(row, staged),
        }
        Ok(())
    }

    /// Raw byte copy into `component` at `row`, bypassing hooks. Used when
    /// materialising a row from an existing value rather than replacing it.
    pub fn copy_component(
        &mut self,
        row: usize,
        component: Entity,
        bytes: &[u8],
    ) -> EcsResult<()> {
        let index = self
            .column_index(component)
            .ok_or(EcsError::UnknownComponent(component))?;
        let column = &mut self.data.columns[index];
        if column.size() == 0 {
            return Ok(());
        }
        if bytes.len() != column.size() {
            return Err(EcsError::UnknownComponent(component));
        }
        column.write_row(row, bytes);
        Ok(())
    }

    /// Bytes of `component` at `row`.
    pub fn component_bytes(&self, row: usize, component: Entity) -> Option<&[u8]> {
        let column = self.column(component)?;
        if column.size() == 0 {
            Some(&[])
        } else {
            Some(column.row(row))
        }
    }
}

/// Moves one row from `src` to `dst`, the hot path of every add/remove
/// transition.
///
/// ## Behavior
/// Columns are matched **by id**:
/// - Ids present in both types are byte-copied column by column. A `merge`
///   hook, if registered, combines the incoming value with the fresh
///   destination row instead of a raw copy.
/// - Ids only in the destination are zero-initialised, then `init` runs.
/// - Ids only in the source are `fini`-finalised before the source row is
///   released.
///
/// ## Returns
/// The destination row, and the entity that was swapped into the vacated
/// source row (whose record the caller must repair).
pub fn move_row(
    src: &mut Table,
    dst: &mut Table,
    src_row: usize,
    registry: &ComponentRegistry,
) -> (usize, Option<Entity>) {
    debug_assert!(src_row < src.count());

    let entity = src.data.entities[src_row];
    let record_ref = src.data.record_ptrs[src_row];

    let dst_row = dst.data.entities.len();
    dst.data.entities.push(entity);
    dst.data.record_ptrs.push(record_ref);

    for (i, &type_id) in dst.type_ids.iter().enumerate() {
        let column = &mut dst.data.columns[i];
        let at = column.push_zeroed();
        debug_assert_eq!(at, dst_row);
        if column.size() == 0 {
            continue;
        }

        let hooks = registry
            .info(type_id)
            .map(|info| info.hooks)
            .unwrap_or_default();

        match src.column(type_id) {
            Some(src_column) => match hooks.merge {
                Some(merge) => {
                    if let Some(init) = hooks.init {
                        init(column.row_mut(at));
                    }
                    merge(column.row_mut(at), src_column.row(src_row));
                }
                None => column.write_row(at, src_column.row(src_row)),
            },
            None => {
                if let Some(init) = hooks.init {
                    init(column.row_mut(at));
                }
            }
        }
    }

    for (i, &type_id) in src.type_ids.iter().enumerate() {
        if dst.has(type_id) {
            continue;
        }
        let column = &mut src.data.columns[i];
        if column.size() == 0 {
            continue;
        }
        if let Some(fini) = registry.info(type_id).and_then(|info| info.hooks.fini) {
            fini(column.row_mut(src_row));
        }
    }

    // Shared values were copied out and source-only values finalised, so the
    // source row is released without destructors.
    let moved = src.swap_remove(src_row, registry, false);

    (dst_row, moved)
}
