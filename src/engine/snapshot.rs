//! # Snapshots
//!
//! Deep byte images of the main stage, optionally restricted by a filter,
//! and the restore path that replays one into a world.
//!
//! ## Shape
//! A snapshot holds the table set (types, entity rows, raw column bytes),
//! the entities without rows (empty types), per-entity watched flags, and
//! the handle counter. Together these reproduce the entity index exactly,
//! keyed by the order tables appear in the image.
//!
//! ## Restore
//! Restore replaces the main stage wholesale: tables are recreated in image
//! order, rows are appended and overwritten with the stored bytes, records
//! are rebuilt, and every query is rematched. The component registry is
//! *not* part of the image; the target world must have the same components
//! registered, which is also what a freshly created world needs before a
//! restore.
//!
//! Taking a snapshot of a restored world yields a byte-equal image, filter
//! included.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::engine::entity_index::{Record, RecordState};
use crate::engine::error::{EcsError, EcsResult};
use crate::engine::stage::Stage;
use crate::engine::table_cache::TableCache;
use crate::engine::types::{Entity, EntityId, PackedRow};
use crate::engine::world::World;

/// How the include set of a [`Filter`] is evaluated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FilterKind {
    /// Type must contain every include id.
    #[default]
    MatchAll,
    /// Type must contain at least one include id.
    MatchAny,
    /// Type must equal the include set exactly.
    MatchExact,
}

/// Restricts which tables a snapshot captures.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Filter {
    /// Ids the type must carry, per `include_kind`. Empty matches all.
    pub include: Vec<Entity>,

    /// Ids that disqualify a type when present.
    pub exclude: Vec<Entity>,

    /// Evaluation mode of the include set.
    pub include_kind: FilterKind,
}

impl Filter {
    /// Returns `true` if a type passes the filter.
    pub fn matches(&self, type_ids: &[Entity]) -> bool {
        if self
            .exclude
            .iter()
            .any(|id| type_ids.binary_search(id).is_ok())
        {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        match self.include_kind {
            FilterKind::MatchAll => self
                .include
                .iter()
                .all(|id| type_ids.binary_search(id).is_ok()),
            FilterKind::MatchAny => self
                .include
                .iter()
                .any(|id| type_ids.binary_search(id).is_ok()),
            FilterKind::MatchExact => {
                let mut sorted = self.include.clone();
                sorted.sort_unstable();
                sorted.dedup();
                sorted.as_slice() == type_ids
            }
        }
    }
}

/// Byte image of one table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SnapshotTable {
    /// Canonical sorted type ids.
    pub type_ids: Box<[Entity]>,

    /// Entities in row order.
    pub entities: Vec<Entity>,

    /// Watched flag per row, parallel to `entities`.
    pub watched: Vec<bool>,

    /// Raw bytes per component id, row-major concatenation.
    pub columns: Vec<(Entity, Vec<u8>)>,
}

/// Deep byte image of the main stage restricted by a filter.
#[derive(Clone, PartialEq, Debug)]
pub struct Snapshot {
    /// Captured tables in arena order.
    pub tables: Vec<SnapshotTable>,

    /// Entities with an empty type, with their watched flags.
    pub empty_entities: Vec<(Entity, bool)>,

    /// Handle counter at capture time.
    pub last_handle: EntityId,

    /// Filter the image was restricted by.
    pub filter: Filter,
}

impl World {
    /// Captures a deep byte image of the main stage.
    pub fn snapshot(&self, filter: Filter) -> Snapshot {
        let mut tables = Vec::new();
        for table in &self.main.stores.tables {
            if table.id == 0 || !filter.matches(&table.type_ids) {
                continue;
            }

            let watched = table
                .data
                .entities
                .iter()
                .map(|&e| {
                    self.main
                        .entity_index
                        .get(e)
                        .map(|r| r.row.is_watched())
                        .unwrap_or(false)
                })
                .collect();

            let columns = table
                .type_ids
                .iter()
                .enumerate()
                .filter(|(i, _)| table.data.columns[*i].size() > 0)
                .map(|(i, &id)| (id, table.data.columns[i].bytes().to_vec()))
                .collect();

            tables.push(SnapshotTable {
                type_ids: table.type_ids.clone(),
                entities: table.data.entities.clone(),
                watched,
                columns,
            });
        }

        let mut empty_entities: Vec<(Entity, bool)> = Vec::new();
        if filter.matches(&[]) {
            for (entity, state) in self.main.entity_index.iterate() {
                if let RecordState::Alive(record) = state {
                    if record.row.row().is_none() {
                        empty_entities.push((entity, record.row.is_watched()));
                    }
                }
            }
            empty_entities.sort_unstable_by_key(|(e, _)| *e);
        }

        Snapshot {
            tables,
            empty_entities,
            last_handle: self.last_handle.load(Ordering::Relaxed),
            filter,
        }
    }

    /// Replaces the main stage with the contents of a snapshot.
    ///
    /// ## Behavior
    /// - Clears the main stage and all query caches.
    /// - Recreates every captured table, its rows, and its records.
    /// - Leaves the component registry untouched; the snapshot's components
    ///   must already be registered.
    ///
    /// ## Errors
    /// - `StageViolation` while iteration is in progress.
    /// - `UnknownComponent` when the image references unregistered ids.
    pub fn restore(&mut self, snapshot: &Snapshot) -> EcsResult<()> {
        if self.in_progress() {
            return Err(EcsError::StageViolation(Entity::NONE));
        }
        debug!(tables = snapshot.tables.len(), "restoring snapshot");

        let mut main = Stage::new(0, &self.registry);
        main.range_check_enabled = self.main.range_check_enabled;
        self.main = main;
        for query in &mut self.queries {
            query.cache = TableCache::new();
        }

        for image in &snapshot.tables {
            let handle = self.main.trie.intern(&image.type_ids)?;
            let tid = self
                .main
                .stores
                .table_for_type(&self.main.trie, &self.registry, handle)?;

            for (row, &entity) in image.entities.iter().enumerate() {
                let record_ref = self.main.entity_index.make_ref(entity);
                let at = self
                    .main
                    .stores
                    .table_mut(tid)
                    .append(entity, record_ref, &self.registry);
                debug_assert_eq!(at, row);
                self.main.entity_index.set(
                    entity,
                    Record {
                        table: tid,
                        row: PackedRow::at(row).with_watched(image.watched[row]),
                    },
                );
            }

            let table = self.main.stores.table_mut(tid);
            for (id, bytes) in &image.columns {
                let info = self.registry.require(*id)?;
                if info.size == 0 {
                    continue;
                }
                for (row, chunk) in bytes.chunks_exact(info.size).enumerate() {
                    table.copy_component(row, *id, chunk)?;
                }
            }
        }

        for &(entity, watched) in &snapshot.empty_entities {
            self.main.entity_index.set(
                entity,
                Record {
                    table: 0,
                    row: PackedRow::EMPTY.with_watched(watched),
                },
            );
        }

        self.last_handle
            .store(snapshot.last_handle, Ordering::Relaxed);

        self.register_new_tables();
        Ok(())
    }
}
