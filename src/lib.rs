//! # Staged ECS
//!
//! Archetype-based Entity-Component-System storage core with a staged
//! mutation model.
//!
//! ## Design Goals
//! - Archetype (table) storage for cache efficiency
//! - O(1) amortised structural transitions through a cached table graph
//! - Safe iteration under concurrent modification via per-stage buffers
//! - Deterministic merges, reproducible from per-stage deltas
//!
//! This crate builds as both:
//! - `rlib` (for Rust usage & integration tests)
//! - `cdylib` (for FFI / DLL usage)

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]
#![deny(dead_code)]

pub mod engine;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

// Core identifiers and limits

pub use engine::types::{
    Entity, EntityId, PackedRow, QueryId, StageId, TableFlags, TableId, HI_COMPONENT_ID,
    HI_ENTITY_ID, MAX_CHILD_NODES, MAX_ENTITIES_IN_TYPE, MAX_JOBS_PER_WORKER,
};

pub use engine::error::{EcsError, EcsResult, EntityRangeError, TypeTooLargeError};

pub use engine::entity_index::{EntityIndex, Record, RecordRef, RecordState};

pub use engine::type_trie::{TypeHandle, TypeTrie};

pub use engine::component::{
    ComponentHooks, ComponentInfo, ComponentRegistry, COMPONENT, CONTAINER,
    FIRST_USER_COMPONENT, PREFAB,
};

pub use engine::table::{Edge, Table, TableData};

pub use engine::table_cache::{CachePayload, TableCache};

pub use engine::signature::{
    ColumnIs, EntityTypes, FromKind, InOutKind, OperKind, SigColumn, Signature,
};

pub use engine::query::{par_each_table, MatchedTable, Query, Reference};

pub use engine::stage::Stage;

pub use engine::world::{World, WorldConfig, WorldMetrics};

pub use engine::worker::{Context, Job, JobFn};

pub use engine::snapshot::{Filter, FilterKind, Snapshot, SnapshotTable};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude (Optional but recommended)
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used storage-core types.
///
/// Import with:
/// ```rust
/// use staged_ecs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ComponentHooks, Context, EcsError, EcsResult, Entity, Filter, MatchedTable, QueryId,
        SigColumn, Signature, Snapshot, World, WorldConfig,
    };
}
