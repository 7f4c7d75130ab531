// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dense identifiers for graph nodes, pips, and modules.

use std::fmt;

/// Dense 32-bit index into the [`Graph`](crate::graph::Graph).
///
/// `NodeId`s are assigned sequentially at graph-construction time and are
/// stable for the lifetime of the graph (the graph is immutable after
/// construction).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a new node id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer backing this id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns this id as a `usize` index, for indexing dense arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Discriminator distinguishing pip identities that otherwise share a node.
///
/// Most pips map one-to-one onto a [`NodeId`]; the discriminator exists for
/// pip families (e.g. seal-directory variants) that may need to refer to the
/// same underlying node under more than one logical identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PipDiscriminator(u32);

impl PipDiscriminator {
    /// The default discriminator, used by pips with no sub-identity.
    pub const NONE: Self = Self(0);

    /// Creates a new discriminator value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// Identifier for a build action ("pip"): a [`NodeId`] plus a discriminator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PipId {
    node: NodeId,
    discriminator: PipDiscriminator,
}

impl PipId {
    /// Creates a pip id with the default discriminator.
    #[inline]
    #[must_use]
    pub const fn new(node: NodeId) -> Self {
        Self {
            node,
            discriminator: PipDiscriminator::NONE,
        }
    }

    /// Creates a pip id with an explicit discriminator.
    #[inline]
    #[must_use]
    pub const fn with_discriminator(node: NodeId, discriminator: PipDiscriminator) -> Self {
        Self { node, discriminator }
    }

    /// Returns the underlying node id.
    #[inline]
    #[must_use]
    pub const fn node(self) -> NodeId {
        self.node
    }

    /// Returns the discriminator.
    #[inline]
    #[must_use]
    pub const fn discriminator(self) -> PipDiscriminator {
        self.discriminator
    }
}

/// Identifier for a module: a logical grouping of pips used by dirty-build
/// (module mode) to decide which dependencies are "explicitly scheduled".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    /// Creates a new module id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// Index of an opaque (dynamic) directory output within a pip's declared
/// directory outputs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpaqueDirectoryIndex(u32);

impl OpaqueDirectoryIndex {
    /// Creates a new opaque-directory index.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns this index as a `usize`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
