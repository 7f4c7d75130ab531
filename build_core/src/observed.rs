// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Turns a recorded path-set or a batch of live file accesses into a
//! validated [`ObservedInputs`] sequence, the input to strong-fingerprint
//! computation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Digest, Fingerprinter};
use crate::ids::NodeId;
use crate::pip::{DirectoryKind, PipAccessors};

/// How a path was touched during a pip's execution.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PathEntryFlags {
    /// The path was probed for existence but not read.
    FileProbe = 0,
    /// The path was probed as a directory location.
    DirectoryLocation = 1,
    /// The path's parent directory was enumerated and this path was a
    /// member of the enumeration result.
    Enumeration = 2,
    /// The path was consulted as part of a tool-specific search-path probe.
    SearchPath = 3,
}

/// Sandbox options that relax normally-enforced access checks. Each flag
/// set to `true` makes the sandbox *less* strict.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug, Serialize, Deserialize)]
pub struct UnsafeOptions {
    /// Detours/interposition is disabled; no file accesses are observed at
    /// all for the affected category.
    pub disable_detours: bool,
    /// Reparse points are not treated specially (no chain resolution).
    pub ignore_reparse_points: bool,
    /// Accesses performed by preloaded dynamic libraries are not reported.
    pub ignore_preloaded_dlls: bool,
    /// `GetFinalPathNameByHandle`-style resolution results are ignored.
    pub ignore_final_path_resolution: bool,
    /// Directory probes are folded into enumerations rather than tracked
    /// distinctly.
    pub existing_directory_probes_as_enumerations: bool,
}

impl UnsafeOptions {
    fn as_mask(self) -> u8 {
        u8::from(self.disable_detours)
            | (u8::from(self.ignore_reparse_points) << 1)
            | (u8::from(self.ignore_preloaded_dlls) << 2)
            | (u8::from(self.ignore_final_path_resolution) << 3)
            | (u8::from(self.existing_directory_probes_as_enumerations) << 4)
    }

    /// Returns `true` if `self` enables a strict subset of the relaxations
    /// `other` enables (and at least one fewer), i.e. `self` is strictly
    /// safer than `other`.
    #[must_use]
    pub fn is_strictly_safer_than(self, other: Self) -> bool {
        let (a, b) = (self.as_mask(), other.as_mask());
        a & !b == 0 && a != b
    }
}

/// One entry of a recorded path-set.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PathSetEntry {
    /// The path that was touched.
    pub path: PathBuf,
    /// How it was touched.
    pub flags: PathEntryFlags,
}

/// A recorded, content-addressed sequence of paths a pip observed during a
/// prior execution, together with the sandbox options in effect when it was
/// collected.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ObservedPathSet {
    entries: Vec<PathSetEntry>,
    unsafe_options: UnsafeOptions,
}

impl ObservedPathSet {
    /// Creates a path-set from already-collected entries and the unsafe
    /// options in effect when they were collected. Entries are sorted into
    /// case-insensitive path order.
    #[must_use]
    pub fn new(mut entries: Vec<PathSetEntry>, unsafe_options: UnsafeOptions) -> Self {
        entries.sort_by(|a, b| case_insensitive_key(&a.path).cmp(&case_insensitive_key(&b.path)));
        Self {
            entries,
            unsafe_options,
        }
    }

    /// Returns the recorded entries in case-insensitive path order.
    #[must_use]
    pub fn entries(&self) -> &[PathSetEntry] {
        &self.entries
    }

    /// Returns the unsafe options recorded alongside this path-set.
    #[must_use]
    pub fn unsafe_options(&self) -> UnsafeOptions {
        self.unsafe_options
    }

    /// Serializes this path-set to its stable, deterministic byte encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory representation cannot be encoded,
    /// which does not happen for well-formed entries.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserializes a path-set previously written by
    /// [`ObservedPathSet::to_bytes`]. Unknown trailing fields are tolerated
    /// by `bincode`'s struct layout only when using versioned schemas; this
    /// format is exact-shape and any mismatch is reported as an error by the
    /// caller via [`crate::error::CoreError::CacheMiss`] with reason
    /// `InvalidDescriptor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding of this type.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Computes the content hash of this path-set's serialized form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (see
    /// [`ObservedPathSet::to_bytes`]).
    pub fn content_hash(&self, fingerprinter: &Fingerprinter) -> Result<Digest, bincode::Error> {
        Ok(fingerprinter.hash_bytes(&self.to_bytes()?))
    }
}

fn case_insensitive_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// A validated observed-input entry: a path, how it was touched, and
/// (if applicable) the content hash of what was read.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ObservedInput {
    /// The path, already expanded (reparse points/symlinks resolved by the
    /// sandbox; this crate does not perform symlink chain validation
    /// itself).
    pub path: PathBuf,
    /// How it was touched.
    pub flags: PathEntryFlags,
    /// Content hash of the path's contents at observation time, if this was
    /// a read rather than a probe/enumeration.
    pub content_hash: Option<Digest>,
}

/// A validated, case-insensitive-path-ordered sequence of observed inputs.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ObservedInputs {
    entries: Vec<ObservedInput>,
}

impl ObservedInputs {
    /// Returns the validated entries in case-insensitive path order.
    #[must_use]
    pub fn entries(&self) -> &[ObservedInput] {
        &self.entries
    }
}

/// The outcome of processing one path-set or batch of live observations.
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// The path-set applies to this pip and its observed inputs are ready
    /// for strong-fingerprint computation.
    Success(ObservedInputs),
    /// This path-set does not apply to this pip right now; the caller
    /// should move on to the next candidate.
    Mismatched,
    /// A hard validation failure occurred; the owning pip must fail.
    Aborted {
        /// The path that failed validation.
        path: PathBuf,
        /// Why it failed.
        reason: String,
    },
}

/// Coarse status corresponding to a [`ProcessingOutcome`], without the
/// payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessingStatus {
    /// See [`ProcessingOutcome::Success`].
    Success,
    /// See [`ProcessingOutcome::Mismatched`].
    Mismatched,
    /// See [`ProcessingOutcome::Aborted`].
    Aborted,
}

impl ProcessingOutcome {
    /// Returns the coarse status for this outcome.
    #[must_use]
    pub const fn status(&self) -> ProcessingStatus {
        match self {
            Self::Success(_) => ProcessingStatus::Success,
            Self::Mismatched => ProcessingStatus::Mismatched,
            Self::Aborted { .. } => ProcessingStatus::Aborted,
        }
    }
}

/// One path observed live, during sandboxed execution, before validation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawObservation {
    /// The observed path.
    pub path: PathBuf,
    /// How it was touched.
    pub flags: PathEntryFlags,
    /// Content hash, if the access was a read.
    pub content_hash: Option<Digest>,
}

/// Validates observed accesses against a pip's declared dependencies.
#[derive(Debug, Default)]
pub struct ObservedInputProcessor;

impl ObservedInputProcessor {
    /// Creates a processor. Stateless.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validates a recorded path-set's entries against `node`'s declared
    /// dependencies, replaying it as a candidate for the current lookup.
    pub fn process_path_set(
        &self,
        graph: &impl PipAccessors,
        node: NodeId,
        path_set: &ObservedPathSet,
    ) -> ProcessingOutcome {
        self.validate(graph, node, path_set.entries().iter().map(|e| RawObservation {
            path: e.path.clone(),
            flags: e.flags,
            content_hash: None,
        }))
    }

    /// Validates a batch of live observations collected during a fresh
    /// sandboxed execution.
    pub fn process_live(
        &self,
        graph: &impl PipAccessors,
        node: NodeId,
        observations: impl IntoIterator<Item = RawObservation>,
    ) -> ProcessingOutcome {
        self.validate(graph, node, observations)
    }

    fn validate(
        &self,
        graph: &impl PipAccessors,
        node: NodeId,
        observations: impl IntoIterator<Item = RawObservation>,
    ) -> ProcessingOutcome {
        let mut entries = Vec::new();
        for obs in observations {
            if !is_permitted(graph, node, &obs.path, obs.flags) {
                return ProcessingOutcome::Aborted {
                    path: obs.path,
                    reason: "path is not among this pip's declared dependencies".to_string(),
                };
            }
            entries.push(ObservedInput {
                path: obs.path,
                flags: obs.flags,
                content_hash: obs.content_hash,
            });
        }
        entries.sort_by(|a, b| case_insensitive_key(&a.path).cmp(&case_insensitive_key(&b.path)));
        ProcessingOutcome::Success(ObservedInputs { entries })
    }

    /// Computes the path-set content hash to use for strong-fingerprint
    /// computation, re-hashing under `current_options` when they are
    /// strictly safer than the options the path-set was recorded under.
    ///
    /// # Errors
    ///
    /// Returns an error if re-serialization fails.
    pub fn reconcile_path_set_hash(
        &self,
        path_set: &ObservedPathSet,
        recorded_hash: Digest,
        current_options: UnsafeOptions,
        fingerprinter: &Fingerprinter,
    ) -> Result<Digest, bincode::Error> {
        if current_options.is_strictly_safer_than(path_set.unsafe_options()) {
            let rehashed = ObservedPathSet::new(path_set.entries().to_vec(), current_options);
            rehashed.content_hash(fingerprinter)
        } else {
            Ok(recorded_hash)
        }
    }
}

/// Applies the membership rule for `flags`. `FileProbe`/`DirectoryLocation`
/// require an exact match against a declared dependency. `Enumeration` and
/// `SearchPath` additionally permit paths that merely share a declared
/// dependency's containing directory: enumeration fingerprinting observes
/// every member of a probed directory (not just the declared one), and a
/// tool's search-path probing walks directories known to hold a declared
/// input without declaring each candidate file individually.
fn is_permitted(graph: &impl PipAccessors, node: NodeId, path: &Path, flags: PathEntryFlags) -> bool {
    if is_exact_dependency_member(graph, node, path) {
        return true;
    }
    match flags {
        PathEntryFlags::FileProbe | PathEntryFlags::DirectoryLocation => false,
        PathEntryFlags::Enumeration => is_within_declared_directory(graph, node, path),
        PathEntryFlags::SearchPath => {
            is_within_declared_directory(graph, node, path)
                || shares_parent_with_file_dependency(graph, node, path)
        }
    }
}

fn is_exact_dependency_member(graph: &impl PipAccessors, node: NodeId, path: &Path) -> bool {
    for file_dep in graph.file_dependencies(node) {
        if file_dep.path.as_path() == path {
            return true;
        }
    }
    for dir_dep in graph.directory_dependencies(node) {
        match dir_dep.kind {
            // Dynamic (opaque) directory contents are not statically known;
            // any path is permitted once a pip declares at least one such
            // dependency.
            DirectoryKind::Dynamic => return true,
            DirectoryKind::Static => {
                if dir_dep.sealed_contents.iter().any(|p| p.as_path() == path) {
                    return true;
                }
            }
        }
    }
    false
}

fn is_within_declared_directory(graph: &impl PipAccessors, node: NodeId, path: &Path) -> bool {
    for dir_dep in graph.directory_dependencies(node) {
        match dir_dep.kind {
            DirectoryKind::Dynamic => return true,
            DirectoryKind::Static => {
                if dir_dep
                    .sealed_contents
                    .iter()
                    .any(|p| p.parent() == path.parent())
                {
                    return true;
                }
            }
        }
    }
    false
}

fn shares_parent_with_file_dependency(graph: &impl PipAccessors, node: NodeId, path: &Path) -> bool {
    graph
        .file_dependencies(node)
        .iter()
        .any(|f| f.path.parent() == path.parent())
}
