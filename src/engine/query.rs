//! Query registration, table matching, and iteration.
//!
//! A query owns a [`TableCache`] of every table its signature matches,
//! partitioned into active and empty tables so iteration never visits rows
//! that do not exist. Tables enter the cache when they are created or when
//! a merge grafts them in; they move between partitions as their row counts
//! cross zero.
//!
//! ## Matched tables
//! Each cached entry records how the signature's columns map onto the
//! table: a positive code selects a table column, zero means no data, and a
//! negative code selects an entry of the reference list, which names the
//! entity a non-self column resolves against.
//!
//! ## Cascade ordering
//! Queries with a cascade column iterate matched tables in ascending
//! container depth, so parents are always visited before their children.

use rayon::prelude::*;

use crate::engine::signature::{
    cascade_depth, resolve_id, skip_table, ColumnIs, EntityTypes, FromKind, OperKind,
    Resolution, Signature,
};
use crate::engine::table::Table;
use crate::engine::table_cache::{CachePayload, TableCache};
use crate::engine::types::{Entity, QueryId, TableId};

/// A component resolved on an entity other than the iterated one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reference {
    /// Entity the component lives on.
    pub entity: Entity,

    /// Component to fetch.
    pub component: Entity,
}

/// One table matched by a query, with the column mapping worked out at
/// match time.
#[derive(Clone, Debug)]
pub struct MatchedTable {
    /// Matched table.
    pub table: TableId,

    /// Per signature column: `n > 0` is table column `n - 1`, `0` is no
    /// data, `n < 0` is reference `-n - 1`.
    pub columns: Vec<i32>,

    /// Resolved component id per signature column.
    pub components: Vec<Entity>,

    /// Reference columns for non-self sources.
    pub references: Vec<Reference>,

    /// Container depth used for cascade ordering.
    pub depth: i32,
}

impl CachePayload for MatchedTable {
    fn table(&self) -> TableId {
        self.table
    }
}

/// A registered query: its signature, optional system entity, and the
/// table cache it keeps current.
pub struct Query {
    /// Query identifier.
    pub id: QueryId,

    /// Compiled signature.
    pub sig: Signature,

    /// System entity for `FromSystem` columns; none for plain queries.
    pub system: Entity,

    /// Matched tables, partitioned by emptiness.
    pub cache: TableCache<MatchedTable>,
}

impl Query {
    /// Creates a query with an empty cache.
    pub fn new(id: QueryId, sig: Signature) -> Self {
        Query {
            id,
            sig,
            system: Entity::NONE,
            cache: TableCache::new(),
        }
    }

    /// Active matched tables in iteration order.
    ///
    /// With a cascade column the tables are sorted by ascending depth;
    /// otherwise cache order is used as is.
    pub fn iter_active(&self) -> Vec<&MatchedTable> {
        let mut active: Vec<&MatchedTable> = self.cache.tables().iter().collect();
        if self.sig.cascade_by != 0 {
            active.sort_by_key(|m| m.depth);
        }
        active
    }
}

/// Matches one table against a signature, producing the column mapping.
///
/// Returns `None` when the table does not satisfy the signature.
pub fn match_table(
    sig: &Signature,
    table: &Table,
    view: &impl EntityTypes,
    system: Entity,
) -> Option<MatchedTable> {
    if skip_table(sig, table.flags) {
        return None;
    }

    let mut columns = Vec::with_capacity(sig.columns.len());
    let mut components = Vec::with_capacity(sig.columns.len());
    let mut references = Vec::new();
    let mut depth = 0;

    for column in &sig.columns {
        let ids: &[Entity] = match &column.is {
            ColumnIs::Component(id) => std::slice::from_ref(id),
            ColumnIs::AnyOf(ids) => ids,
        };

        let mut resolved: Option<(Resolution, Entity)> = None;
        for &id in ids {
            if let Some(r) = resolve_id(table, view, column.from, id, column.source, system) {
                resolved = Some((r, id));
                break;
            }
        }

        match column.oper {
            OperKind::And | OperKind::Or => match resolved {
                Some((resolution, id)) => {
                    push_resolution(&mut columns, &mut references, resolution, id);
                    components.push(id);
                }
                None => return None,
            },
            OperKind::Not => match resolved {
                Some(_) => return None,
                None => {
                    columns.push(0);
                    components.push(ids.first().copied().unwrap_or(Entity::NONE));
                }
            },
            OperKind::Optional => match resolved {
                Some((resolution, id)) => {
                    push_resolution(&mut columns, &mut references, resolution, id);
                    components.push(id);
                }
                None => {
                    columns.push(0);
                    components.push(ids.first().copied().unwrap_or(Entity::NONE));
                }
            },
        }

        if column.from == FromKind::Cascade {
            if let ColumnIs::Component(id) = &column.is {
                depth = cascade_depth(view, &table.type_ids, *id, 0);
            }
        }
    }

    Some(MatchedTable {
        table: table.id,
        columns,
        components,
        references,
        depth,
    })
}

fn push_resolution(
    columns: &mut Vec<i32>,
    references: &mut Vec<Reference>,
    resolution: Resolution,
    component: Entity,
) {
    match resolution {
        Resolution::Column(index) => columns.push(index as i32 + 1),
        Resolution::NoData => columns.push(0),
        Resolution::Ref(entity) => {
            references.push(Reference { entity, component });
            columns.push(-(references.len() as i32));
        }
    }
}

/// Runs `f` over every active matched table of a query in parallel.
///
/// Read-only fan-out helper for callers that partition work per table; the
/// tables slice is the main-stage arena.
pub fn par_each_table<F>(query: &Query, tables: &[Table], f: F)
where
    F: Fn(&MatchedTable, &Table) + Sync + Send,
{
    query
        .cache
        .tables()
        .par_iter()
        .for_each(|matched| f(matched, &tables[matched.table as usize]));
}
