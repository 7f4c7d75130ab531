// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Persistent dirty/perpetual-dirty/materialized tracker and its concurrent
//! staging buffer.
//!
//! ## Invariants (must hold at every quiescent point)
//!
//! - `dirty ⊆ nodes`, `perpetual_dirty ⊆ nodes`, `materialized ⊆ nodes`.
//! - Effective dirty set is `dirty ∪ perpetual_dirty`.
//! - If `n ∈ dirty` then every transitive out-neighbor of `n` is in `dirty`
//!   (downward closure over outgoing/"depends-on" edges).
//! - `materialized ∩ dirty = ∅`, except when the node is also in
//!   `perpetual_dirty` (perpetually-dirty nodes may be simultaneously
//!   materialized because they are redirtied after each run).
//!
//! Direct methods on [`DirtyTracker`] are not thread-safe. Concurrent
//! callers stage their writes through [`PendingUpdates`] instead; a single
//! owner thread calls [`PendingUpdates::apply`] at barrier points.

use std::sync::Arc;

use dashmap::DashSet;

use crate::bitset::{BitsetDecodeError, NodeSet};
use crate::error::CoreError;
use crate::graph::Graph;
use crate::ids::NodeId;

/// Persistent dirty/perpetual/materialized state over a fixed [`Graph`].
#[derive(Debug)]
pub struct DirtyTracker {
    graph: Arc<Graph>,
    dirty: NodeSet,
    perpetual_dirty: NodeSet,
    materialized: NodeSet,
    // Reused BFS scratch buffer for `mark_dirty`, to avoid reallocating on
    // every call in hot incremental-build loops.
    bfs_scratch: Vec<NodeId>,
}

impl DirtyTracker {
    /// Creates a tracker with every node initially clean and
    /// non-materialized.
    #[must_use]
    pub fn new(graph: Arc<Graph>) -> Self {
        let capacity = graph.len();
        Self {
            graph,
            dirty: NodeSet::with_capacity(capacity),
            perpetual_dirty: NodeSet::with_capacity(capacity),
            materialized: NodeSet::with_capacity(capacity),
            bfs_scratch: Vec::new(),
        }
    }

    /// Returns `true` if `n ∈ dirty ∪ perpetual_dirty`.
    #[must_use]
    pub fn is_dirty(&self, n: NodeId) -> bool {
        self.dirty.contains(n) || self.perpetual_dirty.contains(n)
    }

    /// Returns `true` if `n` is currently materialized.
    #[must_use]
    pub fn is_materialized(&self, n: NodeId) -> bool {
        self.materialized.contains(n)
    }

    /// Returns `true` if `n` is materialized and not dirty.
    #[must_use]
    pub fn is_clean_and_materialized(&self, n: NodeId) -> bool {
        !self.is_dirty(n) && self.is_materialized(n)
    }

    /// Returns `true` if `n` is in the perpetually-dirty set.
    #[must_use]
    pub fn is_perpetual(&self, n: NodeId) -> bool {
        self.perpetual_dirty.contains(n)
    }

    /// Removes `n` from `dirty` (not `perpetual_dirty`).
    pub fn mark_clean(&mut self, n: NodeId) {
        self.dirty.remove(n);
    }

    /// Marks `n` dirty, transitively dirtying every downstream node reached
    /// by following outgoing ("depends-on") edges.
    ///
    /// No-op if `n` is already dirty. Each newly dirtied node is removed
    /// from `materialized`, and `on_visit` (if supplied) is invoked for it,
    /// in BFS order.
    pub fn mark_dirty(&mut self, n: NodeId, mut on_visit: Option<&mut dyn FnMut(NodeId)>) {
        self.mark_dirty_batch(std::iter::once(n), on_visit.as_deref_mut());
    }

    /// Batch form of [`DirtyTracker::mark_dirty`]: the BFS is seeded with
    /// every not-yet-dirty node in `roots`.
    pub fn mark_dirty_batch(
        &mut self,
        roots: impl IntoIterator<Item = NodeId>,
        mut on_visit: Option<&mut dyn FnMut(NodeId)>,
    ) {
        self.bfs_scratch.clear();
        for root in roots {
            if self.dirty.insert(root) {
                self.materialized.remove(root);
                if let Some(cb) = on_visit.as_deref_mut() {
                    cb(root);
                }
                self.bfs_scratch.push(root);
            }
        }

        let mut cursor = 0;
        while cursor < self.bfs_scratch.len() {
            let node = self.bfs_scratch[cursor];
            cursor += 1;
            for &dependent in self.graph.incoming(node) {
                if self.dirty.insert(dependent) {
                    self.materialized.remove(dependent);
                    if let Some(cb) = on_visit.as_deref_mut() {
                        cb(dependent);
                    }
                    self.bfs_scratch.push(dependent);
                }
            }
        }
    }

    /// Marks `n` materialized.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::GraphContract`] if the precondition
    /// `¬is_dirty(n) ∨ n ∈ perpetual_dirty` does not hold.
    pub fn mark_materialized(&mut self, n: NodeId) -> Result<(), CoreError> {
        if self.is_dirty(n) && !self.is_perpetual(n) {
            return Err(CoreError::GraphContract(format!(
                "mark_materialized precondition violated for {n}: node is dirty and not perpetual"
            )));
        }
        self.materialized.insert(n);
        Ok(())
    }

    /// Adds `n` to the perpetually-dirty set.
    pub fn mark_perpetual(&mut self, n: NodeId) {
        self.perpetual_dirty.insert(n);
    }

    /// Serializes the tracker state as three length-prefixed bitmaps in the
    /// fixed order `dirty`, `materialized`, `perpetual`.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.dirty.serialize(&mut out);
        self.materialized.serialize(&mut out);
        self.perpetual_dirty.serialize(&mut out);
        out
    }

    /// Deserializes a tracker previously written by
    /// [`DirtyTracker::serialize`].
    ///
    /// # Errors
    ///
    /// Returns [`BitsetDecodeError`] if the byte stream is malformed.
    pub fn deserialize(graph: Arc<Graph>, bytes: &[u8]) -> Result<Self, BitsetDecodeError> {
        let mut offset = 0;
        let dirty = NodeSet::deserialize(bytes, &mut offset)?;
        let materialized = NodeSet::deserialize(bytes, &mut offset)?;
        let perpetual_dirty = NodeSet::deserialize(bytes, &mut offset)?;
        Ok(Self {
            graph,
            dirty,
            perpetual_dirty,
            materialized,
            bfs_scratch: Vec::new(),
        })
    }

    /// Returns the graph this tracker is bound to.
    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Returns a snapshot of the currently dirty set (excluding
    /// perpetual-only nodes).
    #[must_use]
    pub fn dirty_set(&self) -> &NodeSet {
        &self.dirty
    }

    /// Returns a snapshot of the materialized set.
    #[must_use]
    pub fn materialized_set(&self) -> &NodeSet {
        &self.materialized
    }

    /// Returns a snapshot of the perpetually-dirty set.
    #[must_use]
    pub fn perpetual_set(&self) -> &NodeSet {
        &self.perpetual_dirty
    }
}

/// Concurrent staging buffer for [`DirtyTracker`] mutations.
///
/// Writers only add to one of three sets (lock-free with respect to each
/// other); a single owner thread calls [`PendingUpdates::apply`] at barrier
/// points to make the changes visible. This is the only synchronization
/// point concurrent execution needs in order to mutate tracker state.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    clean: DashSet<NodeId>,
    perpetual: DashSet<NodeId>,
    materialized: DashSet<NodeId>,
}

impl PendingUpdates {
    /// Creates an empty staging buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `n` to be marked clean on the next [`PendingUpdates::apply`].
    pub fn stage_clean(&self, n: NodeId) {
        self.clean.insert(n);
    }

    /// Stages `n` to be marked perpetually dirty (and implicitly clean) on
    /// the next [`PendingUpdates::apply`].
    pub fn stage_perpetual(&self, n: NodeId) {
        self.perpetual.insert(n);
    }

    /// Stages `n` to be marked materialized on the next
    /// [`PendingUpdates::apply`].
    pub fn stage_materialized(&self, n: NodeId) {
        self.materialized.insert(n);
    }

    /// Applies every staged mutation to `tracker`, in the fixed order:
    ///
    /// 1. marks from `clean`
    /// 2. marks from `perpetual` (and their implicit clean)
    /// 3. marks from `materialized`
    /// 4. re-dirties every node currently in `perpetual_dirty`, along with
    ///    their transitive dependents, so perpetual nodes are correctly
    ///    dirty again for the next build.
    ///
    /// This is idempotent: every step is itself a no-op when repeated, so a
    /// second `apply()` call (with nothing newly staged in between) leaves
    /// the tracker unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::GraphContract`] if a staged `mark_materialized`
    /// violates the tracker's precondition.
    pub fn apply(&self, tracker: &mut DirtyTracker) -> Result<(), CoreError> {
        for n in drain(&self.clean) {
            tracker.mark_clean(n);
        }

        for n in drain(&self.perpetual) {
            tracker.mark_perpetual(n);
            tracker.mark_clean(n);
        }

        for n in drain(&self.materialized) {
            tracker.mark_materialized(n)?;
        }

        let perpetual_roots: Vec<NodeId> = tracker.perpetual_set().iter().collect();
        tracker.mark_dirty_batch(perpetual_roots, None);

        Ok(())
    }
}

fn drain(set: &DashSet<NodeId>) -> Vec<NodeId> {
    let items: Vec<NodeId> = set.iter().map(|r| *r).collect();
    for item in &items {
        set.remove(item);
    }
    items
}
