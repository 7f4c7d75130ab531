// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pip declarations and the capability record used to decouple the
//! build-set calculator from any concrete pip representation.
//!
//! Rather than a generic abstract base parameterized over the concrete pip,
//! path, file, and directory types, the calculator depends on a small
//! capability record: [`PipAccessors`], a trait holding just the accessor
//! functions it needs. [`Graph`](crate::graph::Graph) implements it directly;
//! no subclassing is required.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ids::{ModuleId, NodeId};

/// The kind of build action a pip represents.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PipKind {
    /// Runs a sandboxed external process.
    Process,
    /// Copies a single file.
    CopyFile,
    /// Materializes file content supplied at declaration time.
    WriteFile,
    /// Invokes a long-lived IPC server (moniker for "service pip" style
    /// interactions; lifecycle start/stop is external to this crate).
    Ipc,
    /// Produces a logical directory, static or dynamic (opaque).
    SealDirectory(DirectoryKind),
    /// Hashes a source file already present on disk.
    HashSourceFile,
    /// Organizational node with no executable effect.
    MetaPip(MetaPipKind),
}

impl PipKind {
    /// Returns `true` for non-materializing organizational nodes.
    ///
    /// Meta-pips are excluded from incremental scheduling as a dependent:
    /// they never appear in the Phase B build cone and their dependents are
    /// assumed to be meta-pips themselves (see [`crate::calc`]).
    #[inline]
    #[must_use]
    pub const fn is_meta_pip(&self) -> bool {
        matches!(self, Self::MetaPip(_))
    }

    /// Returns `true` if this pip kind is a `Process`.
    #[inline]
    #[must_use]
    pub const fn is_process(&self) -> bool {
        matches!(self, Self::Process)
    }
}

/// Sub-kind of an organizational meta-pip.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetaPipKind {
    /// Groups a set of pips for scheduling/reporting purposes only.
    Group,
    /// Marks a module boundary.
    ModuleBoundary,
    /// Marks the completion of a logical phase (e.g. "all copies done").
    PhaseBarrier,
}

/// Whether a directory output is statically enumerated or discovered at
/// execution time (opaque/dynamic seal).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DirectoryKind {
    /// Contents are known ahead of execution.
    Static,
    /// Contents are discovered dynamically; presence cannot be statically
    /// probed.
    Dynamic,
}

/// A declared file input: the producing node plus the path the input is
/// materialized at.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FileInput {
    /// The node that produces this file (may be a non-process pip, e.g.
    /// `WriteFile` or `HashSourceFile`).
    pub producer: NodeId,
    /// Path the file is expected to be materialized at.
    pub path: Arc<PathBuf>,
}

/// A declared directory input: the producing seal-directory node, whether it
/// is static or dynamic, and (for static directories) the sealed member
/// paths.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DirectoryInput {
    /// The `SealDirectory` node that produces this directory.
    pub producer: NodeId,
    /// Static vs. dynamic seal.
    pub kind: DirectoryKind,
    /// Member paths of a static seal. Empty for dynamic seals, whose
    /// contents are not statically known.
    pub sealed_contents: Vec<Arc<PathBuf>>,
}

/// Capability record giving the build-set calculator (and other core
/// components) read-only access to pip declarations without depending on a
/// concrete pip type.
pub trait PipAccessors {
    /// Returns the kind of `node`.
    fn pip_kind(&self, node: NodeId) -> PipKind;

    /// Returns the declared file inputs of `node`.
    fn file_dependencies(&self, node: NodeId) -> &[FileInput];

    /// Returns the declared directory inputs of `node`.
    fn directory_dependencies(&self, node: NodeId) -> &[DirectoryInput];

    /// Returns the module `node` belongs to, if modules are in use.
    fn module_of(&self, node: NodeId) -> Option<ModuleId>;

    /// Returns `true` if `node` is conservatively treated as "rewritten"
    /// (always excluded from the clean-materialized frontier).
    fn is_rewritten(&self, node: NodeId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_pip_is_reported_as_meta() {
        assert!(PipKind::MetaPip(MetaPipKind::Group).is_meta_pip());
        assert!(!PipKind::Process.is_meta_pip());
    }
}
