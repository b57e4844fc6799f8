//! # Type Trie
//!
//! Interning structure that canonicalises sorted entity-id sequences into
//! shared [`TypeHandle`] values.
//!
//! ## Purpose
//! A *type* is an ordered, duplicate-free set of entity ids and is the
//! identity of an archetype table. Interning guarantees that two equal id
//! sequences always yield the same handle, so the rest of the engine can
//! compare types by handle equality alone.
//!
//! ## Structure
//! The trie is a rooted tree. A node represents a type `T`; its children
//! represent types `T ∪ {c}` for ids `c` greater than `max(T)`. Children are
//! looked up with a two-tier strategy:
//!
//! - When `c - max(T)` is below [`MAX_CHILD_NODES`], the child node lives in
//!   a dense array indexed by the offset. Component-id-only types stay on
//!   this path because component ids are bounded by the same constant.
//! - Otherwise the *entire remaining suffix* of the sequence is stored in
//!   the node's bucketed map, keyed by the hash of the suffix relative to
//!   the node's type.
//!
//! Interned types are also threaded through a creation-order list so merges
//! and diagnostics can walk every known type linearly.
//!
//! ## Invariants
//! - The mapping from id sequence to handle is injective.
//! - Input sequences are sorted ascending with no duplicates.
//! - No type holds more than [`MAX_ENTITIES_IN_TYPE`] ids.

use std::hash::{Hash, Hasher};

use fxhash::FxHasher;

use crate::engine::error::{EcsResult, TypeTooLargeError};
use crate::engine::types::{
    Entity, EntityId, MAX_CHILD_NODES, MAX_ENTITIES_IN_TYPE, TYPE_BUCKET_COUNT,
};

/// Shared handle to an interned type. Equal id sequences intern to equal
/// handles, so handle comparison suffices at runtime.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeHandle(pub u32);

impl TypeHandle {
    /// Handle of the empty type, interned when the trie is created.
    pub const EMPTY: TypeHandle = TypeHandle(0);
}

type NodeId = u32;

struct TrieNode {
    /// Type interned at this node, if any id sequence ends here.
    ty: Option<TypeHandle>,

    /// Largest id of the node's own type; child offsets are relative to it.
    base: EntityId,

    /// Dense children indexed by `child_id - base`.
    dense: Vec<Option<NodeId>>,

    /// Bucketed suffix storage for offsets past the dense range. Each entry
    /// holds the full remaining suffix and the handle it interns to.
    buckets: Option<Box<[Vec<(Box<[Entity]>, TypeHandle)>]>>,
}

impl TrieNode {
    fn new(base: EntityId) -> Self {
        TrieNode {
            ty: None,
            base,
            dense: Vec::new(),
            buckets: None,
        }
    }
}

/// Interning trie over sorted id sequences.
///
/// Types are stored in an arena in creation order; [`iter_types`]
/// (Self::iter_types) walks them linearly, oldest first.
pub struct TypeTrie {
    nodes: Vec<TrieNode>,
    types: Vec<Box<[Entity]>>,
}

impl Default for TypeTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTrie {
    /// Creates a trie containing only the empty type.
    pub fn new() -> Self {
        let mut trie = TypeTrie {
            nodes: vec![TrieNode::new(0)],
            types: Vec::new(),
        };
        trie.nodes[0].ty = Some(TypeHandle::EMPTY);
        trie.types.push(Vec::new().into_boxed_slice());
        trie
    }

    /// Number of interned types, the empty type included.
    #[inline]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if only the empty type is interned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.types.len() == 1
    }

    /// Canonical sorted ids of an interned type.
    #[inline]
    pub fn type_of(&self, handle: TypeHandle) -> &[Entity] {
        &self.types[handle.0 as usize]
    }

    /// Walks all interned types in creation order.
    pub fn iter_types(&self) -> impl Iterator<Item = (TypeHandle, &[Entity])> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, ids)| (TypeHandle(i as u32), ids.as_ref()))
    }

    /// Interns a sorted id sequence, returning its shared handle.
    ///
    /// ## Behavior
    /// - Walks dense children while offsets permit, creating intermediate
    ///   nodes on demand.
    /// - Falls over to the bucketed suffix path at the first oversized
    ///   offset.
    /// - Equal sequences always return equal handles.
    ///
    /// ## Errors
    /// `TypeTooLarge` when the sequence exceeds the per-type id limit.
    ///
    /// ## Invariants
    /// `ids` must be sorted ascending without duplicates.
    pub fn intern(&mut self, ids: &[Entity]) -> EcsResult<TypeHandle> {
        if ids.len() > MAX_ENTITIES_IN_TYPE {
            return Err(TypeTooLargeError {
                len: ids.len(),
                max: MAX_ENTITIES_IN_TYPE,
            }
            .into());
        }
        debug_assert!(
            ids.windows(2).all(|w| w[0] < w[1]),
            "type ids must be sorted and unique"
        );

        let mut node = 0 as NodeId;
        for (at, &id) in ids.iter().enumerate() {
            let base = self.nodes[node as usize].base;
            debug_assert!(id.0 > base || (base == 0 && at == 0));
            let offset = id.0 - base;

            if offset < MAX_CHILD_NODES {
                node = self.dense_child(node, id, offset as usize);
            } else {
                return Ok(self.intern_suffix(node, ids, at));
            }
        }

        if let Some(handle) = self.nodes[node as usize].ty {
            return Ok(handle);
        }
        let handle = self.alloc_handle(ids);
        self.nodes[node as usize].ty = Some(handle);
        Ok(handle)
    }

    /// Non-inserting lookup of a sorted id sequence.
    pub fn handle_of(&self, ids: &[Entity]) -> Option<TypeHandle> {
        if ids.len() > MAX_ENTITIES_IN_TYPE {
            return None;
        }

        let mut node = 0 as NodeId;
        for (at, &id) in ids.iter().enumerate() {
            let current = &self.nodes[node as usize];
            let offset = id.0.checked_sub(current.base)?;

            if offset < MAX_CHILD_NODES {
                node = (*current.dense.get(offset as usize)?)?;
            } else {
                let suffix = &ids[at..];
                let buckets = current.buckets.as_ref()?;
                let bucket = &buckets[Self::bucket_of(suffix)];
                return bucket
                    .iter()
                    .find(|(stored, _)| stored.as_ref() == suffix)
                    .map(|&(_, handle)| handle);
            }
        }
        self.nodes[node as usize].ty
    }

    /// Interns the type of `handle` with `id` inserted in sorted position.
    /// Interning the id twice yields the same handle back.
    pub fn with_added(&mut self, handle: TypeHandle, id: Entity) -> EcsResult<TypeHandle> {
        let ids = self.type_of(handle);
        match ids.binary_search(&id) {
            Ok(_) => Ok(handle),
            Err(at) => {
                let mut next = Vec::with_capacity(ids.len() + 1);
                next.extend_from_slice(&ids[..at]);
                next.push(id);
                next.extend_from_slice(&ids[at..]);
                self.intern(&next)
            }
        }
    }

    /// Interns the type of `handle` with `id` removed. Removing an absent id
    /// yields the same handle back.
    pub fn with_removed(&mut self, handle: TypeHandle, id: Entity) -> EcsResult<TypeHandle> {
        let ids = self.type_of(handle);
        match ids.binary_search(&id) {
            Err(_) => Ok(handle),
            Ok(at) => {
                let mut next = Vec::with_capacity(ids.len() - 1);
                next.extend_from_slice(&ids[..at]);
                next.extend_from_slice(&ids[at + 1..]);
                self.intern(&next)
            }
        }
    }

    fn dense_child(&mut self, node: NodeId, id: Entity, offset: usize) -> NodeId {
        let next_len = self.nodes.len() as NodeId;
        let current = &mut self.nodes[node as usize];
        if current.dense.len() <= offset {
            current.dense.resize(offset + 1, None);
        }
        match current.dense[offset] {
            Some(child) => child,
            None => {
                current.dense[offset] = Some(next_len);
                self.nodes.push(TrieNode::new(id.0));
                next_len
            }
        }
    }

    fn intern_suffix(&mut self, node: NodeId, ids: &[Entity], at: usize) -> TypeHandle {
        let suffix = &ids[at..];
        let bucket_index = Self::bucket_of(suffix);

        {
            let current = &self.nodes[node as usize];
            if let Some(buckets) = current.buckets.as_ref() {
                if let Some(&(_, handle)) = buckets[bucket_index]
                    .iter()
                    .find(|(stored, _)| stored.as_ref() == suffix)
                {
                    return handle;
                }
            }
        }

        let handle = self.alloc_handle(ids);
        let current = &mut self.nodes[node as usize];
        let buckets = current.buckets.get_or_insert_with(|| {
            (0..TYPE_BUCKET_COUNT)
                .map(|_| Vec::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        buckets[bucket_index].push((suffix.to_vec().into_boxed_slice(), handle));
        handle
    }

    fn alloc_handle(&mut self, ids: &[Entity]) -> TypeHandle {
        let handle = TypeHandle(self.types.len() as u32);
        self.types.push(ids.to_vec().into_boxed_slice());
        handle
    }

    fn bucket_of(suffix: &[Entity]) -> usize {
        let mut hasher = FxHasher::default();
        suffix.hash(&mut hasher);
        (hasher.finish() as usize) % TYPE_BUCKET_COUNT
    }
}
