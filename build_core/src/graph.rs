// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Immutable DAG of build actions ("pips") with deterministic edge
//! iteration.
//!
//! A [`Graph`] is built once (via [`GraphBuilder`]) and is read-only for the
//! remainder of the process. Edges point from a pip to its dependencies
//! ("outgoing" = depends-on); [`Graph::incoming`] is the reverse adjacency,
//! i.e. dependents.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ids::{ModuleId, NodeId};
use crate::pip::{DirectoryInput, FileInput, PipAccessors, PipKind};

#[derive(Debug)]
struct NodeRecord {
    kind: PipKind,
    file_deps: Vec<FileInput>,
    dir_deps: Vec<DirectoryInput>,
    module: Option<ModuleId>,
    rewritten: bool,
    outgoing: Vec<NodeId>,
    incoming: Vec<NodeId>,
}

/// Immutable, deterministic-iteration directed acyclic graph of pips.
///
/// Construction happens through [`GraphBuilder`]; once built, a `Graph` is
/// shared read-only across threads. Traversal uses fork-join parallelism and
/// never mutates the graph itself.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<NodeRecord>,
}

impl Graph {
    /// Returns the number of nodes in the graph.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no nodes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if `node` is a valid id in this graph.
    #[inline]
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.nodes.len()
    }

    /// Iterates over every node id in the graph, in ascending id order.
    #[must_use]
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId::new(i as u32))
    }

    /// Returns the outgoing edges ("depends-on") of `node`, in declaration
    /// order. Iteration order is deterministic.
    #[must_use]
    pub fn outgoing(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.index())
            .map_or(&[], |n| n.outgoing.as_slice())
    }

    /// Returns the incoming edges ("depended-on-by") of `node`, in the order
    /// edges were added. Iteration order is deterministic.
    #[must_use]
    pub fn incoming(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.index())
            .map_or(&[], |n| n.incoming.as_slice())
    }
}

impl PipAccessors for Graph {
    fn pip_kind(&self, node: NodeId) -> PipKind {
        self.nodes
            .get(node.index())
            .map_or(PipKind::MetaPip(crate::pip::MetaPipKind::Group), |n| {
                n.kind.clone()
            })
    }

    fn file_dependencies(&self, node: NodeId) -> &[FileInput] {
        self.nodes
            .get(node.index())
            .map_or(&[], |n| n.file_deps.as_slice())
    }

    fn directory_dependencies(&self, node: NodeId) -> &[DirectoryInput] {
        self.nodes
            .get(node.index())
            .map_or(&[], |n| n.dir_deps.as_slice())
    }

    fn module_of(&self, node: NodeId) -> Option<ModuleId> {
        self.nodes.get(node.index()).and_then(|n| n.module)
    }

    fn is_rewritten(&self, node: NodeId) -> bool {
        self.nodes.get(node.index()).is_some_and(|n| n.rewritten)
    }
}

/// Error produced while constructing a [`Graph`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum GraphBuildError {
    /// An edge referenced a node id that was never added.
    #[error("edge referenced unknown node id {0}")]
    UnknownNodeId(NodeId),
}

/// Builder for an immutable [`Graph`].
///
/// Nodes must be added (via [`GraphBuilder::add_node`]) before any edge that
/// references them.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeRecord>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn add_node(&mut self, kind: PipKind) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(NodeRecord {
            kind,
            file_deps: Vec::new(),
            dir_deps: Vec::new(),
            module: None,
            rewritten: false,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        });
        id
    }

    /// Assigns `node` to `module`.
    pub fn set_module(&mut self, node: NodeId, module: ModuleId) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.module = Some(module);
        }
    }

    /// Marks `node` as conservatively rewritten (never eligible for the
    /// clean-materialized frontier).
    pub fn set_rewritten(&mut self, node: NodeId, rewritten: bool) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.rewritten = rewritten;
        }
    }

    /// Declares a file input, producer -> path, for `node`.
    pub fn add_file_dependency(&mut self, node: NodeId, producer: NodeId, path: PathBuf) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.file_deps.push(FileInput {
                producer,
                path: Arc::new(path),
            });
        }
    }

    /// Declares a directory input for `node`.
    pub fn add_directory_dependency(&mut self, node: NodeId, dep: DirectoryInput) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.dir_deps.push(dep);
        }
    }

    /// Adds a dependency edge `from -> to` (i.e. `from` depends on `to`).
    ///
    /// # Errors
    ///
    /// Returns [`GraphBuildError::UnknownNodeId`] if either endpoint was
    /// never added via [`GraphBuilder::add_node`].
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphBuildError> {
        if from.index() >= self.nodes.len() {
            return Err(GraphBuildError::UnknownNodeId(from));
        }
        if to.index() >= self.nodes.len() {
            return Err(GraphBuildError::UnknownNodeId(to));
        }
        self.nodes[from.index()].outgoing.push(to);
        self.nodes[to.index()].incoming.push(from);
        Ok(())
    }

    /// Consumes the builder, producing an immutable [`Graph`].
    #[must_use]
    pub fn build(self) -> Graph {
        Graph { nodes: self.nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pip::PipKind;

    #[test]
    fn edge_iteration_order_is_deterministic() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(PipKind::Process);
        let c = b.add_node(PipKind::Process);
        let d = b.add_node(PipKind::Process);
        b.add_edge(a, c).unwrap();
        b.add_edge(a, d).unwrap();
        let g = b.build();
        assert_eq!(g.outgoing(a), &[c, d]);
        assert_eq!(g.incoming(c), &[a]);
    }

    #[test]
    fn unknown_node_id_is_rejected() {
        let mut b = GraphBuilder::new();
        let a = b.add_node(PipKind::Process);
        let bogus = NodeId::new(99);
        assert_eq!(
            b.add_edge(a, bogus),
            Err(GraphBuildError::UnknownNodeId(bogus))
        );
    }

    #[test]
    fn out_of_range_node_queries_return_empty_slices() {
        let g = GraphBuilder::new().build();
        assert_eq!(g.outgoing(NodeId::new(0)), &[]);
        assert_eq!(g.incoming(NodeId::new(0)), &[]);
        assert!(!g.contains(NodeId::new(0)));
    }
}
