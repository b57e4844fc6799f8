//! # Table Cache
//!
//! Query-local list of matched tables, partitioned into active (non-empty)
//! and empty arrays with an O(1) table-to-index map.
//!
//! ## Purpose
//! Iteration must never touch tables without rows, so every query keeps its
//! matches split into two arrays and moves tables between them as their row
//! counts cross zero. The map makes that move O(1) instead of a scan.
//!
//! ## Encoding
//! The map stores one signed integer per table. Non-negative values index
//! the active array directly. Negative values encode positions in the empty
//! array as `stored = -(actual + 1)`, so position 0 of the empty array is
//! stored as `-1`.
//!
//! ## Swap-remove repair
//! Moving a table out of a partition swap-removes it, which relocates the
//! partition's former last element into the vacated slot. That element's map
//! entry must be rewritten with a correctly signed value for the partition
//! it stayed in. When the moved table *was* the last element of its
//! partition, no other entry needs fixing, and none is touched.
//!
//! ## Invariants
//! - `stored >= 0` implies `tables[stored]` is the table.
//! - `stored < 0` implies `empty_tables[-stored - 1]` is the table.
//! - `tables.len() + empty_tables.len() == index.len()`.

use fxhash::FxHashMap;

use crate::engine::types::TableId;

/// Payload stored per matched table.
pub trait CachePayload {
    /// Table this payload belongs to.
    fn table(&self) -> TableId;
}

/// Partitioned table list with a signed-index lookup map.
pub struct TableCache<P> {
    index: FxHashMap<TableId, i32>,
    tables: Vec<P>,
    empty_tables: Vec<P>,
}

impl<P: CachePayload> Default for TableCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CachePayload> TableCache<P> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        TableCache {
            index: FxHashMap::default(),
            tables: Vec::new(),
            empty_tables: Vec::new(),
        }
    }

    /// Active (non-empty) tables.
    #[inline]
    pub fn tables(&self) -> &[P] {
        &self.tables
    }

    /// Empty tables.
    #[inline]
    pub fn empty_tables(&self) -> &[P] {
        &self.empty_tables
    }

    /// Total number of cached tables across both partitions.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the cache holds no tables.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns `true` if `table` is cached.
    #[inline]
    pub fn contains(&self, table: TableId) -> bool {
        self.index.contains_key(&table)
    }

    /// Raw signed index entry of `table`, mainly for tests and diagnostics.
    #[inline]
    pub fn raw_index(&self, table: TableId) -> Option<i32> {
        self.index.get(&table).copied()
    }

    /// Borrows the payload of `table` regardless of partition.
    pub fn get(&self, table: TableId) -> Option<&P> {
        let stored = *self.index.get(&table)?;
        if stored >= 0 {
            self.tables.get(stored as usize)
        } else {
            self.empty_tables.get(decode_empty(stored))
        }
    }

    /// Mutably borrows the payload of `table`.
    pub fn get_mut(&mut self, table: TableId) -> Option<&mut P> {
        let stored = *self.index.get(&table)?;
        if stored >= 0 {
            self.tables.get_mut(stored as usize)
        } else {
            self.empty_tables.get_mut(decode_empty(stored))
        }
    }

    /// Inserts a payload, choosing the partition by `empty`.
    ///
    /// Returns a mutable borrow of the stored payload so the caller can
    /// finish populating it in place.
    pub fn insert(&mut self, payload: P, empty: bool) -> &mut P {
        let table = payload.table();
        debug_assert!(
            !self.index.contains_key(&table),
            "table inserted into cache twice"
        );

        if empty {
            self.empty_tables.push(payload);
            let stored = -(self.empty_tables.len() as i32);
            self.index.insert(table, stored);
            self.empty_tables.last_mut().expect("just pushed")
        } else {
            let stored = self.tables.len() as i32;
            self.tables.push(payload);
            self.index.insert(table, stored);
            self.tables.last_mut().expect("just pushed")
        }
    }

    /// Removes `table` from whichever partition holds it.
    pub fn remove(&mut self, table: TableId) -> Option<P> {
        let stored = self.index.remove(&table)?;
        let payload = if stored >= 0 {
            let at = stored as usize;
            let payload = self.tables.swap_remove(at);
            self.repair(false, at);
            payload
        } else {
            let at = decode_empty(stored);
            let payload = self.empty_tables.swap_remove(at);
            self.repair(true, at);
            payload
        };
        debug_assert_eq!(payload.table(), table);
        Some(payload)
    }

    /// Moves `table` into the partition selected by `empty`.
    ///
    /// A table already in the correct partition is left untouched. Unknown
    /// tables are ignored.
    pub fn set_empty(&mut self, table: TableId, empty: bool) {
        let Some(&stored) = self.index.get(&table) else {
            return;
        };

        // Already on the right side, nothing to do.
        if empty && stored < 0 {
            return;
        }
        if !empty && stored >= 0 {
            return;
        }

        let new_stored = if stored >= 0 {
            let at = stored as usize;
            let payload = self.tables.swap_remove(at);
            self.repair(false, at);
            self.empty_tables.push(payload);
            -(self.empty_tables.len() as i32)
        } else {
            let at = decode_empty(stored);
            let payload = self.empty_tables.swap_remove(at);
            self.repair(true, at);
            let new_index = self.tables.len() as i32;
            self.tables.push(payload);
            new_index
        };

        self.index.insert(table, new_stored);
    }

    /// Rewrites the index entry of the element that `swap_remove` moved into
    /// `vacated`, if any.
    ///
    /// When the removed element was the partition's last (the only-element
    /// case included), nothing was relocated and no entry is touched.
    fn repair(&mut self, empty_partition: bool, vacated: usize) {
        let moved = if empty_partition {
            self.empty_tables.get(vacated)
        } else {
            self.tables.get(vacated)
        };
        let Some(moved) = moved else {
            return;
        };

        let stored = if empty_partition {
            encode_empty(vacated)
        } else {
            vacated as i32
        };
        self.index.insert(moved.table(), stored);
    }
}

#[inline]
fn decode_empty(stored: i32) -> usize {
    debug_assert!(stored < 0);
    (-stored - 1) as usize
}

#[inline]
fn encode_empty(actual: usize) -> i32 {
    -(actual as i32) - 1
}
