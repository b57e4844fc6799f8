//! Parsed signature columns and table matching.
//!
//! A signature is the compiled form of a query expression: an ordered list
//! of columns, each describing one component requirement. Parsing the text
//! expression is a client concern; this module consumes the parsed column
//! records and decides which tables a signature matches.
//!
//! ## Column anatomy
//! Every column carries:
//!
//! - a **from kind**, selecting where the component is resolved: the
//!   entity's own row, an inherited prefab, a container up the parent
//!   relationship, the system entity, an explicit source entity, or nothing
//!   at all;
//! - an **operator**: `And` requires, `Or` admits any id of a set, `Not`
//!   excludes, `Optional` matches either way;
//! - an **in/out kind**, declaring read/write intent for schedulers;
//! - the component (or id set) itself, and an optional fixed source.
//!
//! ## Resolution codes
//! Matching produces one `i32` per column: a positive value `n` means table
//! column `n - 1`, zero means "no data" (tags, optional misses, empty
//! sources), and a negative value `-n` means entry `n - 1` of the match's
//! reference list, used for every non-self source.

use crate::engine::component::{CONTAINER, PREFAB};
use crate::engine::table::Table;
use crate::engine::types::{Entity, TableFlags, MAX_ENTITIES_IN_TYPE};

/// Where a column's component is fetched from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FromKind {
    /// Own row first, then shared prefab data.
    This,
    /// Own row only.
    Owned,
    /// Inherited prefab data only.
    Shared,
    /// A container up the parent relationship.
    Container,
    /// The system entity associated with the query.
    System,
    /// No data; the column only names an id.
    Empty,
    /// An explicit source entity.
    Entity,
    /// Optional container data; orders iteration by depth.
    Cascade,
}

/// Column operator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperKind {
    /// Component must be resolvable.
    And,
    /// Any one id of the set must be resolvable.
    Or,
    /// Component must not be resolvable.
    Not,
    /// Matches with or without the component.
    Optional,
}

/// Declared access intent of a column.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InOutKind {
    /// Read and write.
    InOut,
    /// Read only.
    In,
    /// Write only.
    Out,
}

/// The id payload of a column: a single component or a set for `Or`.
#[derive(Clone, Debug)]
pub enum ColumnIs {
    /// Single id.
    Component(Entity),
    /// Id set, any one of which satisfies the column.
    AnyOf(Box<[Entity]>),
}

/// One parsed signature column.
#[derive(Clone, Debug)]
pub struct SigColumn {
    /// Where the component is resolved.
    pub from: FromKind,

    /// Column operator.
    pub oper: OperKind,

    /// Access intent.
    pub inout: InOutKind,

    /// Component or id set.
    pub is: ColumnIs,

    /// Fixed source entity for [`FromKind::Entity`] columns.
    pub source: Entity,
}

impl SigColumn {
    /// Required component on the entity itself (owned or shared).
    pub fn require(component: Entity) -> Self {
        SigColumn {
            from: FromKind::This,
            oper: OperKind::And,
            inout: InOutKind::InOut,
            is: ColumnIs::Component(component),
            source: Entity::NONE,
        }
    }

    /// Required component, read-only.
    pub fn read(component: Entity) -> Self {
        SigColumn {
            inout: InOutKind::In,
            ..Self::require(component)
        }
    }

    /// Required owned component; shared prefab data does not satisfy it.
    pub fn owned(component: Entity) -> Self {
        SigColumn {
            from: FromKind::Owned,
            ..Self::require(component)
        }
    }

    /// Required shared component; must come from a prefab.
    pub fn shared(component: Entity) -> Self {
        SigColumn {
            from: FromKind::Shared,
            ..Self::require(component)
        }
    }

    /// Excluded component.
    pub fn without(component: Entity) -> Self {
        SigColumn {
            oper: OperKind::Not,
            ..Self::require(component)
        }
    }

    /// Optional component.
    pub fn optional(component: Entity) -> Self {
        SigColumn {
            oper: OperKind::Optional,
            ..Self::require(component)
        }
    }

    /// Any one of a sorted id set.
    pub fn any_of(ids: impl Into<Box<[Entity]>>) -> Self {
        SigColumn {
            from: FromKind::This,
            oper: OperKind::Or,
            inout: InOutKind::InOut,
            is: ColumnIs::AnyOf(ids.into()),
            source: Entity::NONE,
        }
    }

    /// Required component on a container up the parent relationship.
    pub fn container(component: Entity) -> Self {
        SigColumn {
            from: FromKind::Container,
            ..Self::require(component)
        }
    }

    /// Cascade column: optional container data, ordering tables by depth.
    pub fn cascade(component: Entity) -> Self {
        SigColumn {
            from: FromKind::Cascade,
            oper: OperKind::Optional,
            ..Self::require(component)
        }
    }

    /// Component resolved on a fixed source entity.
    pub fn from_entity(source: Entity, component: Entity) -> Self {
        SigColumn {
            from: FromKind::Entity,
            source,
            ..Self::require(component)
        }
    }

    /// Component resolved on the query's system entity.
    pub fn from_system(component: Entity) -> Self {
        SigColumn {
            from: FromKind::System,
            ..Self::require(component)
        }
    }

    /// Id-only column carrying no data.
    pub fn from_empty(component: Entity) -> Self {
        SigColumn {
            from: FromKind::Empty,
            ..Self::require(component)
        }
    }
}

/// A compiled signature: parsed columns plus match-level flags.
#[derive(Clone, Debug)]
pub struct Signature {
    /// Parsed columns in declaration order.
    pub columns: Vec<SigColumn>,

    /// 1-based index of the cascade column, or 0 when there is none.
    pub cascade_by: usize,

    /// Match tables that store prefabs.
    pub match_prefab: bool,

    /// Match tables that store builtin entities.
    pub match_builtins: bool,
}

impl Signature {
    /// Compiles a column list into a signature.
    pub fn new(columns: Vec<SigColumn>) -> Self {
        let cascade_by = columns
            .iter()
            .position(|c| c.from == FromKind::Cascade)
            .map(|i| i + 1)
            .unwrap_or(0);
        Signature {
            columns,
            cascade_by,
            match_prefab: false,
            match_builtins: false,
        }
    }

    /// Returns a copy that also matches prefab tables.
    pub fn matching_prefabs(mut self) -> Self {
        self.match_prefab = true;
        self
    }

    /// Returns `true` if the signature can match tables at all.
    pub fn needs_tables(&self) -> bool {
        self.columns.iter().any(|c| {
            matches!(
                c.from,
                FromKind::This | FromKind::Owned | FromKind::Shared | FromKind::Container
            ) || c.from == FromKind::Cascade
        })
    }
}

/// Read access to entity types, used for prefab and container walks during
/// matching. Implemented by the world over its main stage.
pub trait EntityTypes {
    /// Sorted type ids of a live entity, if any.
    fn entity_type(&self, entity: Entity) -> Option<&[Entity]>;

    /// Returns `true` if the entity carries the prefab tag.
    fn is_prefab(&self, entity: Entity) -> bool {
        self.entity_type(entity)
            .map(|ids| ids.binary_search(&PREFAB).is_ok())
            .unwrap_or(false)
    }

    /// Returns `true` if the entity carries the container tag.
    fn is_container(&self, entity: Entity) -> bool {
        self.entity_type(entity)
            .map(|ids| ids.binary_search(&CONTAINER).is_ok())
            .unwrap_or(false)
    }
}

/// Outcome of resolving one column against one table.
pub(crate) enum Resolution {
    /// Table column, 0-based.
    Column(usize),
    /// No data backs the column.
    NoData,
    /// Data comes from another entity.
    Ref(Entity),
}

/// Resolves a single-id column against a table, following the from kind.
///
/// Returns `None` when the id is unreachable for that kind.
pub(crate) fn resolve_id(
    table: &Table,
    view: &impl EntityTypes,
    from: FromKind,
    id: Entity,
    source: Entity,
    system: Entity,
) -> Option<Resolution> {
    match from {
        FromKind::Owned => table.column_index(id).map(Resolution::Column),
        FromKind::Shared => {
            shared_source(view, &table.type_ids, id, 0).map(Resolution::Ref)
        }
        FromKind::This => match table.column_index(id) {
            Some(index) => Some(Resolution::Column(index)),
            None => shared_source(view, &table.type_ids, id, 0).map(Resolution::Ref),
        },
        FromKind::Container | FromKind::Cascade => {
            container_source(view, &table.type_ids, id, 0).map(Resolution::Ref)
        }
        FromKind::System => {
            if system.is_none() {
                None
            } else {
                Some(Resolution::Ref(system))
            }
        }
        FromKind::Entity => Some(Resolution::Ref(source)),
        FromKind::Empty => Some(Resolution::NoData),
    }
}

/// Finds the prefab in `type_ids` (directly or through nested prefabs) that
/// owns `component`.
pub(crate) fn shared_source(
    view: &impl EntityTypes,
    type_ids: &[Entity],
    component: Entity,
    depth: usize,
) -> Option<Entity> {
    if depth > MAX_ENTITIES_IN_TYPE {
        return None;
    }
    for &id in type_ids.iter().rev() {
        if id.is_component() || !view.is_prefab(id) {
            continue;
        }
        let prefab_type = view.entity_type(id)?;
        if prefab_type.binary_search(&component).is_ok() {
            return Some(id);
        }
        if let Some(found) = shared_source(view, prefab_type, component, depth + 1) {
            return Some(found);
        }
    }
    None
}

/// Finds the container above `type_ids` whose type owns `component`,
/// walking the parent relationship upward.
pub(crate) fn container_source(
    view: &impl EntityTypes,
    type_ids: &[Entity],
    component: Entity,
    depth: usize,
) -> Option<Entity> {
    if depth > MAX_ENTITIES_IN_TYPE {
        return None;
    }
    for &id in type_ids.iter().rev() {
        if id.is_component() || !view.is_container(id) {
            continue;
        }
        let parent_type = view.entity_type(id)?;
        if parent_type.binary_search(&component).is_ok() {
            return Some(id);
        }
        if let Some(found) = container_source(view, parent_type, component, depth + 1) {
            return Some(found);
        }
    }
    None
}

/// Number of containers above the table whose type owns `component`; the
/// iteration rank of cascade columns.
pub(crate) fn cascade_depth(
    view: &impl EntityTypes,
    type_ids: &[Entity],
    component: Entity,
    depth: usize,
) -> i32 {
    if depth > MAX_ENTITIES_IN_TYPE {
        return 0;
    }
    let mut rank = 0;
    for &id in type_ids.iter() {
        if id.is_component() || !view.is_container(id) {
            continue;
        }
        if let Some(parent_type) = view.entity_type(id) {
            let own = i32::from(parent_type.binary_search(&component).is_ok());
            rank = rank.max(own + cascade_depth(view, parent_type, component, depth + 1));
        }
    }
    rank
}

/// Returns `true` if a table is filtered out before column resolution.
pub(crate) fn skip_table(sig: &Signature, flags: TableFlags) -> bool {
    if !sig.match_prefab && flags.contains(TableFlags::IS_PREFAB) {
        return true;
    }
    if !sig.match_builtins && flags.contains(TableFlags::HAS_BUILTINS) {
        return true;
    }
    false
}
