//! # World
//!
//! The world owns every piece of the storage core: the component registry,
//! the canonical main stage, the temp and worker stages, registered
//! queries, and the merge protocol that folds stages back into the main
//! stage.
//!
//! ## Staging protocol
//! While iteration is in progress the main stage is read-only. Mutations
//! issued through a [`Context`] are routed: `Context::World` goes straight
//! to the main stage outside iteration and to the temp stage inside it;
//! `Context::Worker` always goes to that worker's stage. A lookup under a
//! stage consults the stage first and falls back to the main stage.
//!
//! ## Merge
//! Merging is serial and runs with `is_merging` set. Stages are folded in
//! ascending stage id: tombstones replay as deletions, shadow records
//! replay as moves or appends into canonical tables, and staged component
//! bytes are folded over main values through each component's merge hook.
//! Tables first observed inside a stage are created in the main arena as
//! part of the fold. Afterwards every table touched is re-evaluated against
//! the query caches.
//!
//! ## Determinism
//! Stage fold order is fixed, and within one stage mutations apply in the
//! order they were issued, so identical per-stage deltas always produce the
//! same final state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace_span};

use crate::engine::component::{
    encode_component_value, ComponentHooks, ComponentRegistry, COMPONENT, CONTAINER, PREFAB,
};
use crate::engine::entity_index::{Record, RecordState};
use crate::engine::error::{EcsError, EcsResult, EntityRangeError};
use crate::engine::query::{match_table, MatchedTable, Query};
use crate::engine::signature::{EntityTypes, Signature};
use crate::engine::stage::Stage;
use crate::engine::table::{move_row, Table};
use crate::engine::type_trie::TypeHandle;
use crate::engine::types::{
    Entity, EntityId, PackedRow, QueryId, TableFlags, TableId, HI_COMPONENT_ID,
};
use crate::engine::worker::{Context, Job, JobFn, WorkerPool};

/// Construction-time world settings.
#[derive(Clone, Copy, Debug)]
pub struct WorldConfig {
    /// First handle the allocator may hand out.
    pub min_handle: EntityId,

    /// Last handle the allocator may hand out.
    pub max_handle: EntityId,

    /// Merge stages automatically when a frame ends.
    pub auto_merge: bool,

    /// Reject out-of-range ids in mutating operations.
    pub range_check_enabled: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            min_handle: HI_COMPONENT_ID,
            max_handle: EntityId::MAX - 1,
            auto_merge: true,
            range_check_enabled: false,
        }
    }
}

/// Frame and merge counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorldMetrics {
    /// Completed frames.
    pub frame_count_total: u64,

    /// Total time spent inside frames.
    pub frame_time_total: Duration,

    /// Total time spent merging stages.
    pub merge_time_total: Duration,
}

/// Guard for externally synchronised access; see [`World::lock`].
pub struct WorldLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// The storage core: stages, tables, queries, and the merge machinery.
pub struct World {
    pub(crate) registry: ComponentRegistry,
    pub(crate) main: Stage,
    pub(crate) temp: Stage,
    pub(crate) workers: Vec<Mutex<Stage>>,
    pub(crate) queries: Vec<Query>,

    pool: Option<WorkerPool>,

    pub(crate) last_handle: AtomicU64,
    min_handle: EntityId,
    max_handle: EntityId,

    in_progress: bool,
    is_merging: bool,
    auto_merge: bool,
    should_quit: AtomicBool,
    locking_enabled: bool,
    mutex: Mutex<()>,

    frame_started: Option<Instant>,
    pub(crate) metrics: WorldMetrics,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Creates a world with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Creates a world and registers the builtin components.
    pub fn with_config(config: WorldConfig) -> Self {
        let registry = ComponentRegistry::new();
        let main = Stage::new(0, &registry);
        let temp = Stage::new(1, &registry);

        let mut world = World {
            registry,
            main,
            temp,
            workers: Vec::new(),
            queries: Vec::new(),
            pool: None,
            last_handle: AtomicU64::new(config.min_handle.max(HI_COMPONENT_ID).saturating_sub(1)),
            min_handle: config.min_handle,
            max_handle: config.max_handle,
            in_progress: false,
            is_merging: false,
            auto_merge: config.auto_merge,
            should_quit: AtomicBool::new(false),
            locking_enabled: false,
            mutex: Mutex::new(()),
            frame_started: None,
            metrics: WorldMetrics::default(),
        };
        world.main.range_check_enabled = config.range_check_enabled;

        world.bootstrap_builtins();
        world
    }

    fn bootstrap_builtins(&mut self) {
        self.registry
            .register(COMPONENT, crate::engine::component::COMPONENT_VALUE_SIZE, 8)
            .expect("builtin component registration cannot fail");
        self.registry
            .register(PREFAB, 0, 1)
            .expect("builtin tag registration cannot fail");
        self.registry
            .register(CONTAINER, 0, 1)
            .expect("builtin tag registration cannot fail");

        for id in [COMPONENT, PREFAB, CONTAINER] {
            self.main
                .entity_index
                .set(id, Record { table: 0, row: PackedRow::EMPTY });
            self.main_add(id, COMPONENT)
                .expect("builtin bootstrap cannot fail");
            let info = self.registry.require(id).expect("just registered");
            let value = encode_component_value(info.size, info.align);
            self.main_set(id, COMPONENT, &value)
                .expect("builtin bootstrap cannot fail");
        }
        self.register_new_tables();
    }

    // ── Configuration and state ─────────────────────────────────────────

    /// Registers component `id` with the given byte layout.
    ///
    /// Also materialises the component as an entity carrying the builtin
    /// component descriptor, which is how component tables get flagged.
    ///
    /// ## Errors
    /// - `StageViolation` during iteration; registration is setup-time.
    /// - `UnknownComponent` for out-of-range ids or layout conflicts.
    pub fn register_component(&mut self, id: Entity, size: usize, align: usize) -> EcsResult<()> {
        if self.in_progress {
            return Err(EcsError::StageViolation(id));
        }
        self.registry.register(id, size, align)?;

        if self.main.entity_index.get(id).is_none() {
            self.main
                .entity_index
                .set(id, Record { table: 0, row: PackedRow::EMPTY });
            self.main_add(id, COMPONENT)?;
            self.main_set(id, COMPONENT, &encode_component_value(size, align))?;
            self.register_new_tables();
        }
        Ok(())
    }

    /// Installs lifecycle hooks for a registered component.
    pub fn set_component_hooks(&mut self, id: Entity, hooks: ComponentHooks) -> EcsResult<()> {
        self.registry.set_hooks(id, hooks)
    }

    /// Restricts the handle allocator to `[min, max]`.
    pub fn set_entity_range(&mut self, min: EntityId, max: EntityId) {
        self.min_handle = min;
        self.max_handle = max;
        let floor = min.max(HI_COMPONENT_ID).saturating_sub(1);
        if self.last_handle.load(Ordering::Relaxed) < floor {
            self.last_handle.store(floor, Ordering::Relaxed);
        }
    }

    /// Enables rejection of out-of-range ids in mutating operations.
    pub fn enable_range_check(&mut self, enabled: bool) {
        self.main.range_check_enabled = enabled;
    }

    /// Enables the world lock around externally synchronised access.
    pub fn enable_locking(&mut self, enabled: bool) {
        self.locking_enabled = enabled;
    }

    /// Takes the world lock. A no-op guard is returned when locking is
    /// disabled.
    pub fn lock(&self) -> Option<WorldLock<'_>> {
        if !self.locking_enabled {
            return None;
        }
        Some(WorldLock {
            _guard: self.mutex.lock().expect("world mutex poisoned"),
        })
    }

    /// Requests cooperative shutdown; honoured by the caller between
    /// frames, never mid-merge.
    pub fn signal_quit(&self) {
        self.should_quit.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if a system signalled shutdown.
    pub fn should_quit(&self) -> bool {
        self.should_quit.load(Ordering::Relaxed)
    }

    /// Returns `true` while a frame is in progress.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Returns `true` while stages are being merged.
    pub fn is_merging(&self) -> bool {
        self.is_merging
    }

    /// Frame and merge counters.
    pub fn metrics(&self) -> WorldMetrics {
        self.metrics
    }

    /// Replaces the worker pool with `count` workers and fresh stages.
    ///
    /// ## Errors
    /// `StageViolation` during iteration; the pool can only be resized
    /// between frames.
    pub fn set_worker_count(&mut self, count: usize) -> EcsResult<()> {
        if self.in_progress {
            return Err(EcsError::StageViolation(Entity::NONE));
        }
        if let Some(mut pool) = self.pool.take() {
            pool.quit();
        }
        self.workers = (0..count)
            .map(|i| Mutex::new(Stage::new(WorkerPool::stage_id(i), &self.registry)))
            .collect();
        if count > 0 {
            self.pool = Some(WorkerPool::spawn(count));
        }
        Ok(())
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.as_ref().map(|p| p.count()).unwrap_or(0)
    }

    /// Signals workers to quit and joins them.
    pub fn quit_workers(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.quit();
        }
        self.workers.clear();
    }

    // ── Frame fences ────────────────────────────────────────────────────

    /// Starts a frame: mutations through `Context::World` are staged from
    /// here until [`end_progress`](Self::end_progress).
    pub fn begin_progress(&mut self) {
        debug_assert!(!self.in_progress, "frame already in progress");
        self.in_progress = true;
        self.frame_started = Some(Instant::now());
    }

    /// Ends a frame, merging all stages when auto-merge is enabled.
    pub fn end_progress(&mut self) -> EcsResult<()> {
        debug_assert!(self.in_progress, "no frame in progress");
        self.in_progress = false;
        if self.auto_merge {
            self.merge()?;
        }
        if let Some(started) = self.frame_started.take() {
            self.metrics.frame_time_total += started.elapsed();
        }
        self.metrics.frame_count_total += 1;
        Ok(())
    }

    // ── Entity lifecycle ────────────────────────────────────────────────

    /// Creates a new entity with an empty type.
    pub fn create(&mut self, ctx: Context) -> EcsResult<Entity> {
        let entity = self.alloc_handle()?;
        match self.route(ctx) {
            Route::Main => {
                self.main
                    .entity_index
                    .set(entity, Record { table: 0, row: PackedRow::EMPTY });
            }
            Route::Temp => {
                staged_create(&mut self.temp, entity);
            }
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                staged_create(&mut stage, entity);
            }
        }
        Ok(entity)
    }

    /// Creates a new entity from a worker context through a shared world
    /// reference. Used by systems running on worker threads.
    pub fn create_from_worker(&self, ctx: Context) -> EcsResult<Entity> {
        let Context::Worker(stage_id) = ctx else {
            return Err(EcsError::StageViolation(Entity::NONE));
        };
        let entity = self.alloc_handle()?;
        let mut stage = self.worker_stage(WorkerPool::worker_index(stage_id));
        staged_create(&mut stage, entity);
        Ok(entity)
    }

    /// Destroys an entity and releases its row.
    pub fn destroy(&mut self, ctx: Context, entity: Entity) -> EcsResult<()> {
        self.check_range(entity)?;
        match self.route(ctx) {
            Route::Main => self.main_destroy(entity),
            Route::Temp => staged_destroy(&self.registry, &self.main, &mut self.temp, entity),
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                staged_destroy(&self.registry, &self.main, &mut stage, entity)
            }
        }
    }

    /// Destroys an entity from a worker context through a shared world
    /// reference.
    pub fn destroy_from_worker(&self, ctx: Context, entity: Entity) -> EcsResult<()> {
        let Context::Worker(stage_id) = ctx else {
            return Err(EcsError::StageViolation(entity));
        };
        self.check_range(entity)?;
        let mut stage = self.worker_stage(WorkerPool::worker_index(stage_id));
        staged_destroy(&self.registry, &self.main, &mut stage, entity)
    }

    /// Returns `true` if the entity is alive as seen from `ctx`: the active
    /// stage is consulted first, then the main stage.
    pub fn is_alive(&self, ctx: Context, entity: Entity) -> bool {
        let staged = match self.route(ctx) {
            Route::Main => None,
            Route::Temp => self.temp.entity_index.state(entity),
            Route::Worker(index) => self.worker_stage(index).entity_index.state(entity),
        };
        match staged {
            Some(RecordState::Alive(_)) => true,
            Some(RecordState::Deleted) => false,
            None => self.main.entity_index.get(entity).is_some(),
        }
    }

    // ── Structural operations ───────────────────────────────────────────

    /// Adds id `component` to the entity's type, moving it to the
    /// neighbouring table. Adding an id the entity already has is a no-op.
    pub fn add_component(&mut self, ctx: Context, entity: Entity, component: Entity) -> EcsResult<()> {
        self.check_range(entity)?;
        match self.route(ctx) {
            Route::Main => {
                self.main_add(entity, component)?;
                self.register_new_tables();
                Ok(())
            }
            Route::Temp => staged_add(&self.registry, &self.main, &mut self.temp, entity, component),
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                staged_add(&self.registry, &self.main, &mut stage, entity, component)
            }
        }
    }

    /// Adds a component from a worker context through a shared world
    /// reference.
    pub fn add_component_from_worker(
        &self,
        ctx: Context,
        entity: Entity,
        component: Entity,
    ) -> EcsResult<()> {
        let Context::Worker(stage_id) = ctx else {
            return Err(EcsError::StageViolation(entity));
        };
        self.check_range(entity)?;
        let mut stage = self.worker_stage(WorkerPool::worker_index(stage_id));
        staged_add(&self.registry, &self.main, &mut stage, entity, component)
    }

    /// Removes id `component` from the entity's type. Removing an id the
    /// entity lacks is a no-op.
    pub fn remove_component(
        &mut self,
        ctx: Context,
        entity: Entity,
        component: Entity,
    ) -> EcsResult<()> {
        self.check_range(entity)?;
        match self.route(ctx) {
            Route::Main => {
                self.main_remove(entity, component)?;
                self.register_new_tables();
                Ok(())
            }
            Route::Temp => {
                staged_remove(&self.registry, &self.main, &mut self.temp, entity, component)
            }
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                staged_remove(&self.registry, &self.main, &mut stage, entity, component)
            }
        }
    }

    /// Removes a component from a worker context through a shared world
    /// reference.
    pub fn remove_component_from_worker(
        &self,
        ctx: Context,
        entity: Entity,
        component: Entity,
    ) -> EcsResult<()> {
        let Context::Worker(stage_id) = ctx else {
            return Err(EcsError::StageViolation(entity));
        };
        self.check_range(entity)?;
        let mut stage = self.worker_stage(WorkerPool::worker_index(stage_id));
        staged_remove(&self.registry, &self.main, &mut stage, entity, component)
    }

    /// Writes the value of `component` on `entity`, adding the component
    /// first when absent.
    pub fn set_component(
        &mut self,
        ctx: Context,
        entity: Entity,
        component: Entity,
        bytes: &[u8],
    ) -> EcsResult<()> {
        self.check_range(entity)?;
        match self.route(ctx) {
            Route::Main => {
                self.main_add(entity, component)?;
                self.main_set(entity, component, bytes)?;
                self.register_new_tables();
                Ok(())
            }
            Route::Temp => {
                staged_set(&self.registry, &self.main, &mut self.temp, entity, component, bytes)
            }
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                staged_set(&self.registry, &self.main, &mut stage, entity, component, bytes)
            }
        }
    }

    /// Writes a component value from a worker context through a shared
    /// world reference.
    pub fn set_component_from_worker(
        &self,
        ctx: Context,
        entity: Entity,
        component: Entity,
        bytes: &[u8],
    ) -> EcsResult<()> {
        let Context::Worker(stage_id) = ctx else {
            return Err(EcsError::StageViolation(entity));
        };
        self.check_range(entity)?;
        let mut stage = self.worker_stage(WorkerPool::worker_index(stage_id));
        staged_set(&self.registry, &self.main, &mut stage, entity, component, bytes)
    }

    /// Marks `parent` as a container and adds it to `child`'s type.
    pub fn add_child_of(&mut self, ctx: Context, child: Entity, parent: Entity) -> EcsResult<()> {
        self.add_component(ctx, parent, CONTAINER)?;
        self.add_component(ctx, child, parent)
    }

    /// Marks an entity as a prefab template.
    pub fn mark_prefab(&mut self, ctx: Context, entity: Entity) -> EcsResult<()> {
        self.add_component(ctx, entity, PREFAB)
    }

    /// Toggles the watched flag on the entity's record.
    ///
    /// During iteration the flag is toggled on the active shadow record
    /// when one exists; workers without a shadow record cannot toggle it.
    pub fn set_watched(&mut self, ctx: Context, entity: Entity, watched: bool) -> EcsResult<()> {
        match self.route(ctx) {
            Route::Main => {
                let record = self
                    .main
                    .entity_index
                    .get(entity)
                    .ok_or(EcsError::InvalidEntity(entity))?;
                self.main.entity_index.set(
                    entity,
                    Record {
                        table: record.table,
                        row: record.row.with_watched(watched),
                    },
                );
                Ok(())
            }
            Route::Temp => set_watched_staged(&mut self.temp, &mut self.main, entity, watched),
            Route::Worker(index) => {
                let mut stage = self.worker_stage(index);
                match stage.entity_index.get(entity) {
                    Some(record) => {
                        let row = record.row.with_watched(watched);
                        stage
                            .entity_index
                            .set(entity, Record { table: record.table, row });
                        Ok(())
                    }
                    None => Err(EcsError::StageViolation(entity)),
                }
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Main-stage bytes of `component` on `entity`. Tags yield an empty
    /// slice.
    pub fn get_component(&self, entity: Entity, component: Entity) -> Option<&[u8]> {
        let record = self.main.entity_index.get(entity)?;
        let row = record.row.row()?;
        self.main.stores.table(record.table).component_bytes(row, component)
    }

    /// Stage-first read: the value `ctx` would observe, copied out. Falls
    /// back to the main stage when the entity has no shadow record.
    pub fn get_staged(&self, ctx: Context, entity: Entity, component: Entity) -> Option<Vec<u8>> {
        let from_stage = |stage: &Stage| -> Option<Option<Vec<u8>>> {
            match stage.entity_index.state(entity)? {
                RecordState::Deleted => Some(None),
                RecordState::Alive(record) => {
                    let row = record.row.row()?;
                    Some(
                        stage
                            .stores
                            .table(record.table)
                            .component_bytes(row, component)
                            .map(|b| b.to_vec()),
                    )
                }
            }
        };

        let staged = match self.route(ctx) {
            Route::Main => None,
            Route::Temp => from_stage(&self.temp),
            Route::Worker(index) => from_stage(&self.worker_stage(index)),
        };
        match staged {
            Some(result) => result,
            None => self.get_component(entity, component).map(|b| b.to_vec()),
        }
    }

    /// Main-stage record of an entity.
    pub fn record(&self, entity: Entity) -> Option<Record> {
        self.main.entity_index.get(entity)
    }

    /// Watched flag of an entity's main-stage record.
    pub fn watched(&self, entity: Entity) -> Option<bool> {
        self.main
            .entity_index
            .get(entity)
            .map(|record| record.row.is_watched())
    }

    /// Returns `true` if `entity` has `component` as seen from the main
    /// stage.
    pub fn has_component(&self, entity: Entity, component: Entity) -> bool {
        self.main
            .entity_index
            .get(entity)
            .map(|record| self.main.stores.table(record.table).has(component))
            .unwrap_or(false)
    }

    /// Sorted type ids of an entity as seen from the main stage.
    pub fn type_of(&self, entity: Entity) -> Option<&[Entity]> {
        let record = self.main.entity_index.get(entity)?;
        Some(&self.main.stores.table(record.table).type_ids)
    }

    /// Borrows a main-stage table.
    pub fn table(&self, table: TableId) -> &Table {
        self.main.stores.table(table)
    }

    /// All main-stage tables in arena order, the root included.
    pub fn tables(&self) -> &[Table] {
        &self.main.stores.tables
    }

    /// Number of main-stage tables, the root included.
    pub fn table_count(&self) -> usize {
        self.main.stores.tables.len()
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Registers a query and matches it against every existing table.
    pub fn register_query(&mut self, sig: Signature) -> QueryId {
        let id = self.queries.len() as QueryId;
        let mut query = Query::new(id, sig);

        let view = MainView {
            main: &self.main,
        };
        let mut matched: Vec<(MatchedTable, bool)> = Vec::new();
        for table in &self.main.stores.tables {
            if table.id == 0 {
                continue;
            }
            if let Some(m) = match_table(&query.sig, table, &view, query.system) {
                matched.push((m, table.count() == 0));
            }
        }

        for (m, empty) in matched {
            let tid = m.table;
            query.cache.insert(m, empty);
            self.main.stores.table_mut(tid).queries.push(id);
        }

        debug!(query = id, tables = query.cache.len(), "query registered");
        self.queries.push(query);
        id
    }

    /// Borrows a registered query.
    pub fn query(&self, id: QueryId) -> &Query {
        &self.queries[id as usize]
    }

    /// Active matched tables of a query in iteration order.
    pub fn iterate(&self, id: QueryId) -> Vec<&MatchedTable> {
        self.queries[id as usize].iter_active()
    }

    /// Runs `run` over every active matched table of a query, splitting
    /// rows into jobs across the worker pool and blocking until all jobs
    /// finish. Falls back to inline execution without a pool.
    pub fn run_threaded(&self, query: QueryId, run: JobFn) -> EcsResult<()> {
        let batches: Vec<(TableId, usize)> = self.queries[query as usize]
            .iter_active()
            .iter()
            .map(|m| (m.table, self.main.stores.table(m.table).count()))
            .collect();

        let Some(pool) = &self.pool else {
            for (table, rows) in batches {
                run(self, Context::World, query, table, 0, rows);
            }
            return Ok(());
        };

        if !self.in_progress {
            return Err(EcsError::StageViolation(Entity::NONE));
        }

        let workers = pool.count();
        let mut queued = false;
        for (table, rows) in batches {
            if rows == 0 {
                continue;
            }
            let chunk = rows.div_ceil(workers);
            for worker in 0..workers {
                let offset = worker * chunk;
                if offset >= rows {
                    break;
                }
                let limit = chunk.min(rows - offset);
                let job = Job {
                    query,
                    table,
                    offset,
                    limit,
                    run,
                };
                if !pool.try_push(worker, job) {
                    // Bounded queue is full: flush the wave, then retry.
                    pool.dispatch(self);
                    queued = false;
                    let pushed = pool.try_push(worker, job);
                    debug_assert!(pushed, "drained queue rejected a job");
                }
                queued = true;
            }
        }
        if queued {
            pool.dispatch(self);
        }
        Ok(())
    }

    // ── Merge ───────────────────────────────────────────────────────────

    /// Folds every non-main stage into the main stage, ascending by stage
    /// id, then repairs the query caches.
    pub fn merge(&mut self) -> EcsResult<()> {
        let span = trace_span!("merge");
        let _enter = span.enter();
        let started = Instant::now();

        self.is_merging = true;
        let result = self.merge_inner();
        self.is_merging = false;
        self.metrics.merge_time_total += started.elapsed();
        result
    }

    fn merge_inner(&mut self) -> EcsResult<()> {
        let mut dirty: Vec<TableId> = Vec::new();

        let mut temp = std::mem::replace(&mut self.temp, Stage::new(1, &self.registry));
        let temp_result = self.apply_stage(&mut temp, &mut dirty);
        temp.clear(&self.registry);
        self.temp = temp;
        temp_result?;

        for index in 0..self.workers.len() {
            let stage_id = WorkerPool::stage_id(index);
            let mut stage = {
                let mut guard = self.worker_stage(index);
                std::mem::replace(&mut *guard, Stage::new(stage_id, &self.registry))
            };
            let result = self.apply_stage(&mut stage, &mut dirty);
            stage.clear(&self.registry);
            *self.worker_stage(index) = stage;
            result?;
        }

        self.register_new_tables();

        dirty.sort_unstable();
        dirty.dedup();
        for table in dirty {
            self.main.stores.table_mut(table).dst_rows.clear();
            self.table_activity_changed(table);
        }

        self.main.stores.check_index()?;
        Ok(())
    }

    fn apply_stage(&mut self, stage: &mut Stage, dirty: &mut Vec<TableId>) -> EcsResult<()> {
        if stage.is_unused() {
            return Ok(());
        }

        let entries: Vec<(Entity, RecordState)> = stage.entity_index.iterate().collect();
        debug!(stage = stage.id, entries = entries.len(), "applying stage");

        let mut stage_dirty: Vec<TableId> = Vec::new();
        for (entity, state) in entries {
            match state {
                RecordState::Deleted => {
                    if let Some(record) = self.main.entity_index.get(entity) {
                        self.main_destroy(entity)?;
                        stage_dirty.push(record.table);
                    }
                }
                RecordState::Alive(record) => {
                    self.apply_shadow_record(stage, entity, record, &mut stage_dirty)?;
                }
            }
        }

        stage.dirty_tables = stage_dirty;
        dirty.extend_from_slice(&stage.dirty_tables);
        Ok(())
    }

    /// Replays one shadow record: resolve the target table in the main
    /// arena, move or append the entity's row, then fold the staged bytes
    /// over the canonical values.
    fn apply_shadow_record(
        &mut self,
        stage: &Stage,
        entity: Entity,
        staged: Record,
        dirty: &mut Vec<TableId>,
    ) -> EcsResult<()> {
        let stage_table = stage.stores.table(staged.table);
        let type_ids: Vec<Entity> = stage_table.type_ids.to_vec();

        let handle = self.main.trie.intern(&type_ids)?;
        let dst = self
            .main
            .stores
            .table_for_type(&self.main.trie, &self.registry, handle)?;

        let main_record = self.main.entity_index.get(entity);
        let main_watched = main_record.map(|r| r.row.is_watched()).unwrap_or(false);
        let watched = main_watched || staged.row.is_watched();

        let dst_row = match main_record {
            Some(record) if record.table == dst => record.row.row(),
            Some(record) => {
                if let Some(src_row) = record.row.row() {
                    if handle == TypeHandle::EMPTY {
                        // The staged type is empty: release the row, the
                        // entity keeps existing without column data.
                        let moved = self
                            .main
                            .stores
                            .table_mut(record.table)
                            .swap_remove(src_row, &self.registry, true);
                        if let Some(moved_entity) = moved {
                            repair_moved(&mut self.main, record.table, src_row, moved_entity);
                        }
                        dirty.push(record.table);
                        None
                    } else {
                        let (src_table, dst_table) = self.main.stores.pair_mut(record.table, dst);
                        let (new_row, moved) =
                            move_row(src_table, dst_table, src_row, &self.registry);
                        if let Some(moved_entity) = moved {
                            repair_moved(&mut self.main, record.table, src_row, moved_entity);
                        }
                        dirty.push(record.table);
                        Some(new_row)
                    }
                } else if handle != TypeHandle::EMPTY {
                    let record_ref = self.main.entity_index.make_ref(entity);
                    Some(self.main.stores.table_mut(dst).append(
                        entity,
                        record_ref,
                        &self.registry,
                    ))
                } else {
                    None
                }
            }
            None => {
                if handle != TypeHandle::EMPTY {
                    let record_ref = self.main.entity_index.make_ref(entity);
                    Some(self.main.stores.table_mut(dst).append(
                        entity,
                        record_ref,
                        &self.registry,
                    ))
                } else {
                    None
                }
            }
        };

        if let (Some(row), Some(staged_row)) = (dst_row, staged.row.row()) {
            let dst_table = self.main.stores.table_mut(dst);
            dst_table.dst_rows.push(row as i32);
            for &id in type_ids.iter() {
                if !id.is_component() {
                    continue;
                }
                let Some(bytes) = stage_table.component_bytes(staged_row, id) else {
                    continue;
                };
                if bytes.is_empty() {
                    continue;
                }
                dst_table.merge_component(row, id, bytes, &self.registry)?;
            }
        }

        let row = match dst_row {
            Some(row) => PackedRow::at(row).with_watched(watched),
            None => PackedRow::EMPTY.with_watched(watched),
        };
        self.main.entity_index.set(entity, Record { table: dst, row });
        dirty.push(dst);
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn alloc_handle(&self) -> EcsResult<Entity> {
        let id = self.last_handle.fetch_add(1, Ordering::Relaxed) + 1;
        if id > self.max_handle {
            return Err(EntityRangeError {
                entity: Entity(id),
                min: self.min_handle,
                max: self.max_handle,
            }
            .into());
        }
        Ok(Entity(id))
    }

    fn check_range(&self, entity: Entity) -> EcsResult<()> {
        if entity.is_none() {
            return Err(EcsError::InvalidEntity(entity));
        }
        if self.main.range_check_enabled
            && !entity.is_component()
            && (entity.0 < self.min_handle || entity.0 > self.max_handle)
        {
            return Err(EntityRangeError {
                entity,
                min: self.min_handle,
                max: self.max_handle,
            }
            .into());
        }
        Ok(())
    }

    fn route(&self, ctx: Context) -> Route {
        match ctx {
            Context::World if self.in_progress => Route::Temp,
            Context::World => Route::Main,
            Context::Worker(stage_id) => Route::Worker(WorkerPool::worker_index(stage_id)),
        }
    }

    fn worker_stage(&self, index: usize) -> MutexGuard<'_, Stage> {
        self.workers[index]
            .lock()
            .expect("worker stage mutex poisoned")
    }

    fn main_destroy(&mut self, entity: Entity) -> EcsResult<()> {
        let record = self
            .main
            .entity_index
            .get(entity)
            .ok_or(EcsError::InvalidEntity(entity))?;

        if let Some(row) = record.row.row() {
            let moved = self
                .main
                .stores
                .table_mut(record.table)
                .swap_remove(row, &self.registry, true);
            if let Some(moved_entity) = moved {
                repair_moved(&mut self.main, record.table, row, moved_entity);
            }
        }
        self.main.entity_index.remove(entity);
        self.table_activity_changed(record.table);
        Ok(())
    }

    fn main_add(&mut self, entity: Entity, component: Entity) -> EcsResult<()> {
        let record = self
            .main
            .entity_index
            .get(entity)
            .ok_or(EcsError::InvalidEntity(entity))?;

        let main = &mut self.main;
        let dst = main
            .stores
            .find_or_create_add(&mut main.trie, &self.registry, record.table, component)?;
        if dst == record.table {
            return Ok(());
        }
        self.main_move(entity, record, dst)
    }

    fn main_remove(&mut self, entity: Entity, component: Entity) -> EcsResult<()> {
        let record = self
            .main
            .entity_index
            .get(entity)
            .ok_or(EcsError::InvalidEntity(entity))?;

        let main = &mut self.main;
        let dst = main
            .stores
            .find_or_create_remove(&mut main.trie, &self.registry, record.table, component)?;
        if dst == record.table {
            return Ok(());
        }
        self.main_move(entity, record, dst)
    }

    fn main_move(&mut self, entity: Entity, record: Record, dst: TableId) -> EcsResult<()> {
        match record.row.row() {
            Some(src_row) => {
                let (src_table, dst_table) = self.main.stores.pair_mut(record.table, dst);
                if dst_table.type_ids.is_empty() {
                    // Destination is the root: release the row instead of
                    // storing an empty one.
                    let moved = src_table.swap_remove(src_row, &self.registry, true);
                    if let Some(moved_entity) = moved {
                        repair_moved(&mut self.main, record.table, src_row, moved_entity);
                    }
                    self.main.entity_index.set(
                        entity,
                        Record {
                            table: dst,
                            row: record.row.cleared(),
                        },
                    );
                } else {
                    let (new_row, moved) = move_row(src_table, dst_table, src_row, &self.registry);
                    if let Some(moved_entity) = moved {
                        repair_moved(&mut self.main, record.table, src_row, moved_entity);
                    }
                    self.main.entity_index.set(
                        entity,
                        Record {
                            table: dst,
                            row: record.row.moved_to(new_row),
                        },
                    );
                }
            }
            None => {
                let record_ref = self.main.entity_index.make_ref(entity);
                let new_row =
                    self.main
                        .stores
                        .table_mut(dst)
                        .append(entity, record_ref, &self.registry);
                self.main.entity_index.set(
                    entity,
                    Record {
                        table: dst,
                        row: record.row.moved_to(new_row),
                    },
                );
            }
        }

        self.table_activity_changed(record.table);
        self.table_activity_changed(dst);
        Ok(())
    }

    fn main_set(&mut self, entity: Entity, component: Entity, bytes: &[u8]) -> EcsResult<()> {
        let record = self
            .main
            .entity_index
            .get(entity)
            .ok_or(EcsError::InvalidEntity(entity))?;
        let row = record
            .row
            .row()
            .ok_or(EcsError::UnknownComponent(component))?;
        self.main
            .stores
            .table_mut(record.table)
            .write_component(row, component, bytes, &self.registry)
    }

    /// Decorates tables created since the last drain and matches them
    /// against every registered query.
    pub(crate) fn register_new_tables(&mut self) {
        loop {
            let new = std::mem::take(&mut self.main.stores.new_tables);
            if new.is_empty() {
                return;
            }

            for tid in new {
                let (flags, parent_count) = {
                    let view = MainView { main: &self.main };
                    decoration(&view, self.main.stores.table(tid))
                };
                {
                    let table = self.main.stores.table_mut(tid);
                    table.flags = flags;
                    table.parent_count = parent_count;
                }

                let mut matched: Vec<(QueryId, MatchedTable)> = Vec::new();
                {
                    let view = MainView { main: &self.main };
                    let table = self.main.stores.table(tid);
                    for query in &self.queries {
                        if let Some(m) = match_table(&query.sig, table, &view, query.system) {
                            matched.push((query.id, m));
                        }
                    }
                }
                let empty = self.main.stores.table(tid).count() == 0;
                for (qid, m) in matched {
                    self.queries[qid as usize].cache.insert(m, empty);
                    self.main.stores.table_mut(tid).queries.push(qid);
                }
            }
        }
    }

    /// Moves a table between the empty and active partitions of every query
    /// that matched it, if its row count crossed zero.
    fn table_activity_changed(&mut self, table: TableId) {
        let empty = self.main.stores.table(table).count() == 0;
        let queries = self.main.stores.table(table).queries.clone();
        for qid in queries {
            self.queries[qid as usize].cache.set_empty(table, empty);
        }
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.quit_workers();
    }
}

enum Route {
    Main,
    Temp,
    Worker(usize),
}

/// Read view over the main stage used for prefab and container walks.
pub(crate) struct MainView<'a> {
    pub main: &'a Stage,
}

impl EntityTypes for MainView<'_> {
    fn entity_type(&self, entity: Entity) -> Option<&[Entity]> {
        let record = self.main.entity_index.get(entity)?;
        Some(&self.main.stores.table(record.table).type_ids)
    }
}

/// Computes flags and parent count for a freshly created table.
fn decoration(view: &MainView<'_>, table: &Table) -> (TableFlags, i32) {
    let mut flags = table.flags;
    let mut parent_count = 0;

    for &id in table.type_ids.iter() {
        if id == COMPONENT {
            flags.insert(TableFlags::HAS_BUILTINS);
        }
        if id == PREFAB {
            flags.insert(TableFlags::IS_PREFAB);
        }
        if !id.is_component() {
            if view.is_prefab(id) {
                flags.insert(TableFlags::HAS_PREFAB);
            }
            if view.is_container(id) {
                parent_count += 1;
            }
        }
    }
    (flags, parent_count)
}

/// Repairs the record of the entity that a swap-remove relocated.
fn repair_moved(main: &mut Stage, table: TableId, row: usize, moved: Entity) {
    if let Some(record) = main.entity_index.get(moved) {
        debug_assert_eq!(record.table, table, "swapped entity belongs elsewhere");
        main.entity_index.set(
            moved,
            Record {
                table,
                row: record.row.moved_to(row),
            },
        );
    }
}

// ── Staged mutation helpers ─────────────────────────────────────────────
//
// These run against one stage with read access to the main stage, which is
// what makes them callable both from `&mut World` (temp stage) and from
// worker threads holding a locked worker stage.

fn staged_create(stage: &mut Stage, entity: Entity) {
    stage
        .entity_index
        .set(entity, Record { table: 0, row: PackedRow::EMPTY });
}

fn staged_destroy(
    registry: &ComponentRegistry,
    main: &Stage,
    stage: &mut Stage,
    entity: Entity,
) -> EcsResult<()> {
    match stage.entity_index.state(entity) {
        Some(RecordState::Deleted) => Ok(()),
        Some(RecordState::Alive(record)) => {
            if let Some(row) = record.row.row() {
                // Shadow rows hold copies; originals are finalised when the
                // deletion replays against the main stage.
                let moved = stage
                    .stores
                    .table_mut(record.table)
                    .swap_remove(row, registry, false);
                if let Some(moved_entity) = moved {
                    repair_moved_staged(stage, record.table, row, moved_entity);
                }
            }
            stage.entity_index.remove(entity);
            Ok(())
        }
        None => {
            if main.entity_index.get(entity).is_none() {
                return Err(EcsError::InvalidEntity(entity));
            }
            // Tombstone via remove on a keep-deletes index.
            stage
                .entity_index
                .set(entity, Record { table: 0, row: PackedRow::EMPTY });
            stage.entity_index.remove(entity);
            Ok(())
        }
    }
}

fn staged_add(
    registry: &ComponentRegistry,
    main: &Stage,
    stage: &mut Stage,
    entity: Entity,
    id: Entity,
) -> EcsResult<()> {
    match stage.entity_index.state(entity) {
        Some(RecordState::Deleted) => Err(EcsError::InvalidEntity(entity)),
        Some(RecordState::Alive(record)) => {
            let Stage { trie, stores, .. } = stage;
            let dst = stores.find_or_create_add(trie, registry, record.table, id)?;
            if dst == record.table {
                return Ok(());
            }
            staged_move(registry, stage, entity, record, dst);
            Ok(())
        }
        None => {
            let main_record = main
                .entity_index
                .get(entity)
                .ok_or(EcsError::InvalidEntity(entity))?;
            let main_table = main.stores.table(main_record.table);
            if main_table.has(id) {
                return Ok(());
            }

            let handle = {
                let base = stage.trie.intern(&main_table.type_ids)?;
                stage.trie.with_added(base, id)?
            };
            let Stage { trie, stores, .. } = stage;
            let dst = stores.table_for_type(trie, registry, handle)?;
            shadow_from_main(registry, main, stage, entity, main_record, dst)
        }
    }
}

fn staged_remove(
    registry: &ComponentRegistry,
    main: &Stage,
    stage: &mut Stage,
    entity: Entity,
    id: Entity,
) -> EcsResult<()> {
    match stage.entity_index.state(entity) {
        Some(RecordState::Deleted) => Err(EcsError::InvalidEntity(entity)),
        Some(RecordState::Alive(record)) => {
            let Stage { trie, stores, .. } = stage;
            let dst = stores.find_or_create_remove(trie, registry, record.table, id)?;
            if dst == record.table {
                return Ok(());
            }
            staged_move(registry, stage, entity, record, dst);
            Ok(())
        }
        None => {
            let main_record = main
                .entity_index
                .get(entity)
                .ok_or(EcsError::InvalidEntity(entity))?;
            let main_table = main.stores.table(main_record.table);
            if !main_table.has(id) {
                return Ok(());
            }

            let handle = {
                let base = stage.trie.intern(&main_table.type_ids)?;
                stage.trie.with_removed(base, id)?
            };
            let Stage { trie, stores, .. } = stage;
            let dst = stores.table_for_type(trie, registry, handle)?;
            shadow_from_main(registry, main, stage, entity, main_record, dst)
        }
    }
}

fn staged_set(
    registry: &ComponentRegistry,
    main: &Stage,
    stage: &mut Stage,
    entity: Entity,
    component: Entity,
    bytes: &[u8],
) -> EcsResult<()> {
    staged_add(registry, main, stage, entity, component)?;

    // The entity may still live only in the main stage when it already had
    // the component; materialise a shadow row so the write stays staged.
    if stage.entity_index.get(entity).is_none() {
        let main_record = main
            .entity_index
            .get(entity)
            .ok_or(EcsError::InvalidEntity(entity))?;
        let main_table = main.stores.table(main_record.table);
        let handle = stage.trie.intern(&main_table.type_ids)?;
        let Stage { trie, stores, .. } = stage;
        let dst = stores.table_for_type(trie, registry, handle)?;
        shadow_from_main(registry, main, stage, entity, main_record, dst)?;
    }

    let record = stage
        .entity_index
        .get(entity)
        .ok_or(EcsError::InvalidEntity(entity))?;
    let row = record
        .row
        .row()
        .ok_or(EcsError::UnknownComponent(component))?;
    stage
        .stores
        .table_mut(record.table)
        .write_component(row, component, bytes, registry)
}

/// Moves an entity's shadow row between two tables of the same stage.
fn staged_move(
    registry: &ComponentRegistry,
    stage: &mut Stage,
    entity: Entity,
    record: Record,
    dst: TableId,
) {
    match record.row.row() {
        Some(src_row) => {
            let (src_table, dst_table) = stage.stores.pair_mut(record.table, dst);
            if dst_table.type_ids.is_empty() {
                let moved = src_table.swap_remove(src_row, registry, false);
                if let Some(moved_entity) = moved {
                    repair_moved_staged(stage, record.table, src_row, moved_entity);
                }
                stage.entity_index.set(
                    entity,
                    Record {
                        table: dst,
                        row: record.row.cleared(),
                    },
                );
            } else {
                let (new_row, moved) = move_row(src_table, dst_table, src_row, registry);
                if let Some(moved_entity) = moved {
                    repair_moved_staged(stage, record.table, src_row, moved_entity);
                }
                stage.entity_index.set(
                    entity,
                    Record {
                        table: dst,
                        row: record.row.moved_to(new_row),
                    },
                );
            }
        }
        None => {
            let record_ref = stage.entity_index.make_ref(entity);
            let new_row = stage
                .stores
                .table_mut(dst)
                .append(entity, record_ref, registry);
            stage.entity_index.set(
                entity,
                Record {
                    table: dst,
                    row: record.row.moved_to(new_row),
                },
            );
        }
    }
}

/// Creates the first shadow row of a main-stage entity, copying its current
/// component values so later staged writes land on a complete row.
fn shadow_from_main(
    registry: &ComponentRegistry,
    main: &Stage,
    stage: &mut Stage,
    entity: Entity,
    main_record: Record,
    dst: TableId,
) -> EcsResult<()> {
    if stage.stores.table(dst).type_ids.is_empty() {
        // Empty target type: the shadow records the intent without a row.
        stage.entity_index.set(
            entity,
            Record {
                table: dst,
                row: PackedRow::EMPTY.with_watched(main_record.row.is_watched()),
            },
        );
        return Ok(());
    }

    let record_ref = stage.entity_index.make_ref(entity);
    let row = stage
        .stores
        .table_mut(dst)
        .append(entity, record_ref, registry);

    if let Some(main_row) = main_record.row.row() {
        let main_table = main.stores.table(main_record.table);
        let shadow_ids: Vec<Entity> = stage.stores.table(dst).type_ids.to_vec();
        for id in shadow_ids {
            if !id.is_component() {
                continue;
            }
            let Some(bytes) = main_table.component_bytes(main_row, id) else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            let bytes = bytes.to_vec();
            stage.stores.table_mut(dst).copy_component(row, id, &bytes)?;
        }
    }

    stage.entity_index.set(
        entity,
        Record {
            table: dst,
            row: PackedRow::at(row).with_watched(main_record.row.is_watched()),
        },
    );
    Ok(())
}

fn repair_moved_staged(stage: &mut Stage, table: TableId, row: usize, moved: Entity) {
    if let Some(record) = stage.entity_index.get(moved) {
        if record.table == table {
            stage.entity_index.set(
                moved,
                Record {
                    table,
                    row: record.row.moved_to(row),
                },
            );
        }
    }
}

fn set_watched_staged(
    stage: &mut Stage,
    main: &mut Stage,
    entity: Entity,
    watched: bool,
) -> EcsResult<()> {
    if let Some(record) = stage.entity_index.get(entity) {
        let row = record.row.with_watched(watched);
        stage
            .entity_index
            .set(entity, Record { table: record.table, row });
        return Ok(());
    }
    let record = main
        .entity_index
        .get(entity)
        .ok_or(EcsError::InvalidEntity(entity))?;
    main.entity_index.set(
        entity,
        Record {
            table: record.table,
            row: record.row.with_watched(watched),
        },
    );
    Ok(())
}
