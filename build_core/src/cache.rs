// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Two-phase cache lookup and publish: weak fingerprint -> path-set ->
//! strong fingerprint -> metadata -> referenced content.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::config::{CachePinMode, CoreConfig};
use crate::counters::Counters;
use crate::error::CoreError;
use crate::fingerprint::{Digest, Fingerprinter, StrongFingerprint, WeakFingerprint};
use crate::ids::NodeId;
use crate::observed::{ObservedInputProcessor, ObservedInputs, ObservedPathSet, ProcessingOutcome};
use crate::pip::PipAccessors;
use crate::sandbox::{LogEvent, LogSeverity, Logger};

/// Why a lookup produced a miss instead of a hit.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, thiserror::Error)]
pub enum CacheMissReason {
    /// Lookups are disabled for diagnostic purposes.
    #[error("artificial miss (forced by configuration)")]
    ArtificialMiss,
    /// This pip is not eligible for caching at all.
    #[error("process pip is not cacheable")]
    ProcessUncacheable,
    /// No entries were returned for the weak fingerprint.
    #[error("no cache entries for weak fingerprint")]
    WeakFingerprint,
    /// Entries existed for the weak fingerprint but none matched the
    /// computed strong fingerprint.
    #[error("no matching strong fingerprint among candidate path-sets")]
    StrongFingerprint,
    /// The matched (weak, path-set, strong) tuple had no cache entry.
    #[error("no cache entry for matched fingerprint tuple")]
    CacheEntry,
    /// The metadata blob was present but failed to deserialize or validate.
    #[error("cache descriptor is malformed or invalid")]
    InvalidDescriptor,
    /// The metadata blob was absent.
    #[error("process metadata blob missing from content store")]
    MissingMetadata,
    /// One or more referenced content hashes were not available.
    #[error("referenced output content missing from content store")]
    MissingOutputContent,
    /// The lookup was cancelled at a suspension point before it could
    /// complete.
    #[error("lookup cancelled")]
    Cancelled,
}

impl CacheMissReason {
    pub(crate) const COUNT: usize = 9;

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ArtificialMiss => 0,
            Self::ProcessUncacheable => 1,
            Self::WeakFingerprint => 2,
            Self::StrongFingerprint => 3,
            Self::CacheEntry => 4,
            Self::InvalidDescriptor => 5,
            Self::MissingMetadata => 6,
            Self::MissingOutputContent => 7,
            Self::Cancelled => 8,
        }
    }
}

/// Where a matched cache entry physically lives, for attribution only.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Locality {
    /// Served from a cache local to this build host.
    Local,
    /// Served from a shared/remote cache.
    Remote,
}

/// One candidate entry returned while enumerating a weak fingerprint.
#[derive(Clone, Debug)]
pub struct EntryRef {
    /// Hash of the candidate path-set blob.
    pub path_set_hash: Digest,
    /// The strong fingerprint this candidate was published under.
    pub strong_fingerprint: StrongFingerprint,
    /// Where this candidate lives.
    pub locality: Locality,
    /// Free-form tag identifying which cache tier served this candidate.
    pub originating_cache: String,
}

/// A published cache entry: everything needed to retrieve a prior
/// execution's outputs given a matched fingerprint tuple.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hash of the associated [`PipCacheDescriptorV2Metadata`] blob.
    pub metadata_hash: Digest,
    /// Free-form attribution tag; preserved verbatim across round-trips.
    pub originating_cache: String,
    /// Content hashes this entry depends on (stdout, stderr, every
    /// cacheable output).
    pub referenced_content: Vec<Digest>,
}

/// Result of materializing a file output: its content, size, and whether it
/// is eligible for caching at all.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileMaterializationInfo {
    /// Content hash, or [`Digest::ABSENT`] if the file is intentionally not
    /// produced.
    pub content_hash: Digest,
    /// Length in bytes.
    pub length: u64,
    /// Declared file name, if the pip renames its output.
    pub file_name: Option<String>,
    /// Reparse-point metadata, if this output is a reparse point. Reparse
    /// points are never cacheable (symbolic-link chain validation is out of
    /// scope for this crate).
    pub reparse_point_info: Option<String>,
}

impl FileMaterializationInfo {
    /// Returns `true` unless this is a reparse point or the absent-file
    /// sentinel hash.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.reparse_point_info.is_none() && self.content_hash != Digest::ABSENT
    }
}

/// One of stdout/stderr as recorded in a descriptor.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// On-disk path the stream was captured to, if retained as a file.
    pub path: Option<PathBuf>,
    /// Content hash of the captured stream.
    pub hash: Digest,
    /// Text encoding of the captured stream.
    pub encoding: String,
}

/// Schema-versioned, content-addressed process-execution metadata.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PipCacheDescriptorV2Metadata {
    /// Weak fingerprint, as a display string (not re-parsed).
    pub weak_fingerprint: String,
    /// Strong fingerprint, as a display string.
    pub strong_fingerprint: String,
    /// A semi-stable identifier for the pip, stable across renumbering of
    /// [`NodeId`]s between builds but not guaranteed globally unique.
    pub semi_stable_pip_id: u64,
    /// Total size in bytes of every cacheable output.
    pub total_output_size: u64,
    /// Per-declared-static-output materialization info, in declaration
    /// order.
    pub static_output_hashes: Vec<FileMaterializationInfo>,
    /// Per-declared-directory-output entries, indexed by opaque directory
    /// index; each entry is `(relative_path, FileMaterializationInfo)`.
    pub dynamic_outputs: Vec<Vec<(PathBuf, FileMaterializationInfo)>>,
    /// Captured standard output, if any.
    pub stdout: Option<StreamDescriptor>,
    /// Captured standard error, if any.
    pub stderr: Option<StreamDescriptor>,
    /// Number of warnings this execution produced.
    pub warning_count: u32,
}

/// The declared output shape of a pip, supplied by the host since pip
/// *output* declarations (unlike inputs) are not modeled by
/// [`crate::graph::Graph`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OutputShape {
    /// Number of statically declared, cacheable file outputs.
    pub cacheable_static_outputs: usize,
    /// Number of declared directory outputs.
    pub declared_directory_outputs: usize,
}

/// The `(weak, path_set_hash, strong, entry)` tuple a cache lookup commits
/// to. Serializable so it can be round-tripped alongside other persisted
/// build state.
#[derive(Clone, Debug)]
pub struct TwoPhaseCachingInfo {
    /// The weak fingerprint used for enumeration.
    pub weak_fingerprint: WeakFingerprint,
    /// Hash of the matched path-set.
    pub path_set_hash: Digest,
    /// The matched strong fingerprint.
    pub strong_fingerprint: StrongFingerprint,
    /// The cache entry the tuple resolved to.
    pub cache_entry: CacheEntry,
}

/// A successful cache lookup.
#[derive(Clone, Debug)]
pub struct CacheHit {
    /// Hash of the matched path-set.
    pub path_set_hash: Digest,
    /// The matched strong fingerprint.
    pub strong_fingerprint: StrongFingerprint,
    /// The process metadata this hit resolved to.
    pub metadata: PipCacheDescriptorV2Metadata,
    /// Hash of the metadata blob.
    pub metadata_hash: Digest,
    /// Where the winning entry was served from.
    pub locality: Locality,
    /// Content hashes of every cacheable artifact this hit references.
    pub cached_artifact_content_hashes: Vec<Digest>,
    /// Outputs that are legitimately absent (non-cacheable by design).
    pub absent_artifacts: Vec<PathBuf>,
    /// Per-directory-output materialized entries, indexed the same way as
    /// [`PipCacheDescriptorV2Metadata::dynamic_outputs`].
    pub dynamic_directory_contents: Vec<Vec<(PathBuf, FileMaterializationInfo)>>,
}

/// Outcome of a [`TwoPhaseCache::publish`] attempt.
#[derive(Clone, Debug)]
pub enum PublishOutcome {
    /// The entry was accepted as-is.
    Published(TwoPhaseCachingInfo),
    /// A conflicting entry already existed for this fingerprint tuple; the
    /// caller should converge to it rather than retry.
    RejectedDueToConflict(CacheEntry),
}

/// Outcome of a raw [`TwoPhaseStore::publish`] call.
#[derive(Clone, Debug)]
pub enum StorePublishOutcome {
    /// The entry was accepted as-is.
    Published,
    /// A conflicting entry already existed for this fingerprint tuple.
    RejectedDueToConflict(CacheEntry),
}

/// Error surfaced by a [`ContentStore`] fetch.
#[derive(Debug, thiserror::Error)]
pub enum ContentFetchError {
    /// No content was stored under the requested hash.
    #[error("content not found")]
    NotFound,
    /// The backing store failed for another reason.
    #[error("content store backend error: {0}")]
    Backend(String),
    /// The operation was cancelled at a suspension point before it could
    /// complete.
    #[error("operation cancelled")]
    Cancelled,
}

/// Store and fetch content-addressed bytes.
pub trait ContentStore: Send + Sync {
    /// Stores `bytes`, returning its content hash.
    fn put(&self, bytes: &[u8]) -> Result<Digest, ContentFetchError>;
    /// Fetches previously stored bytes by hash.
    fn get(&self, hash: Digest) -> Result<Vec<u8>, ContentFetchError>;
    /// Pins `hash` so it cannot be garbage-collected; returns whether the
    /// content was available to pin.
    fn pin(&self, hash: Digest) -> bool;
    /// Returns `true` if the store can guarantee availability of every hash
    /// referenced by `metadata_hash` without an explicit pin.
    fn has_strong_availability_guarantee(&self, metadata_hash: Digest) -> bool;
}

/// The weak/strong fingerprint index.
pub trait TwoPhaseStore: Send + Sync {
    /// Enumerates candidate entries for a weak fingerprint. Order is
    /// implementation-defined.
    fn enumerate(&self, weak: WeakFingerprint) -> Vec<EntryRef>;
    /// Retrieves the entry for a fully matched fingerprint tuple.
    fn get_entry(
        &self,
        weak: WeakFingerprint,
        path_set_hash: Digest,
        strong: StrongFingerprint,
    ) -> Option<CacheEntry>;
    /// Publishes a new entry, or reports the pre-existing conflicting one.
    fn publish(
        &self,
        weak: WeakFingerprint,
        path_set_hash: Digest,
        strong: StrongFingerprint,
        entry: CacheEntry,
    ) -> StorePublishOutcome;
}

#[derive(Clone)]
enum PathSetEvaluation {
    Strong(StrongFingerprint),
    /// This path-set will never match this pip; cached so repeated
    /// candidates sharing a path-set hash are not re-validated.
    Poison,
}

/// Drives the two-phase cache lookup and publish protocol.
pub struct TwoPhaseCache<'a> {
    content_store: &'a dyn ContentStore,
    store: &'a dyn TwoPhaseStore,
    config: &'a CoreConfig,
    counters: &'a Counters,
    logger: &'a dyn Logger,
    fingerprinter: Fingerprinter,
    observed_processor: ObservedInputProcessor,
    path_set_cache: DashMap<Digest, PathSetEvaluation>,
}

impl<'a> TwoPhaseCache<'a> {
    /// Creates a cache driver bound to its backends, configuration,
    /// counters, and logger for the lifetime of this lookup session.
    #[must_use]
    pub fn new(
        content_store: &'a dyn ContentStore,
        store: &'a dyn TwoPhaseStore,
        config: &'a CoreConfig,
        counters: &'a Counters,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            content_store,
            store,
            config,
            counters,
            logger,
            fingerprinter: Fingerprinter::new(),
            observed_processor: ObservedInputProcessor::new(),
            path_set_cache: DashMap::new(),
        }
    }

    fn miss(&self, reason: CacheMissReason) -> CacheMissReason {
        self.counters.record_cache_miss(reason);
        reason
    }

    fn check_cancelled(&self, cancellation: &CancellationToken) -> Result<(), CacheMissReason> {
        if cancellation.is_cancelled() {
            return Err(self.miss(CacheMissReason::Cancelled));
        }
        Ok(())
    }

    /// Logs a transient cache-backend failure as a warning and demotes it to
    /// a miss. Never poisons the path-set cache, since the backend may
    /// recover by the next lookup.
    fn log_cache_unavailable(&self, node: NodeId, source: &str) {
        let error = CoreError::CacheUnavailable(source.to_string());
        self.logger.log(LogEvent {
            code: 2001,
            pip_description: format!("{node:?}"),
            reason_tag: "CacheUnavailable".to_string(),
            message: error.to_string(),
            severity: LogSeverity::Warn,
        });
    }

    /// Runs the lookup protocol for `node` under weak fingerprint `weak`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheMissReason`] (via the miss path) when no hit could be
    /// established; see module documentation for the distinguished reasons.
    pub fn lookup(
        &self,
        graph: &impl PipAccessors,
        node: NodeId,
        weak: WeakFingerprint,
        output_shape: OutputShape,
        cancellation: &CancellationToken,
    ) -> Result<CacheHit, CacheMissReason> {
        if self.config.artificial_cache_miss {
            return Err(self.miss(CacheMissReason::ArtificialMiss));
        }
        self.check_cancelled(cancellation)?;

        let refs = self.store.enumerate(weak);
        if refs.is_empty() {
            return Err(self.miss(CacheMissReason::WeakFingerprint));
        }

        let mut committed: Option<(Digest, StrongFingerprint, Locality, String)> = None;
        for candidate in &refs {
            self.check_cancelled(cancellation)?;
            let evaluation = self.evaluate_path_set(graph, node, weak, candidate.path_set_hash);
            if let PathSetEvaluation::Strong(computed) = evaluation {
                if computed == candidate.strong_fingerprint {
                    committed = Some((
                        candidate.path_set_hash,
                        candidate.strong_fingerprint,
                        candidate.locality,
                        candidate.originating_cache.clone(),
                    ));
                    break;
                }
            }
        }

        let (path_set_hash, strong, locality, _originating) =
            committed.ok_or_else(|| self.miss(CacheMissReason::StrongFingerprint))?;

        let entry = self
            .store
            .get_entry(weak, path_set_hash, strong)
            .ok_or_else(|| self.miss(CacheMissReason::CacheEntry))?;

        self.check_cancelled(cancellation)?;
        let (metadata, metadata_hash) = self.load_metadata(entry.metadata_hash)?;
        self.validate_descriptor_shape(&metadata, output_shape)?;
        self.check_cancelled(cancellation)?;
        self.ensure_content_available(&metadata, metadata_hash)?;

        let cached_artifact_content_hashes = collect_cacheable_hashes(&metadata);
        let absent_artifacts = collect_absent_paths(&metadata);

        Ok(CacheHit {
            path_set_hash,
            strong_fingerprint: strong,
            metadata: metadata.clone(),
            metadata_hash,
            locality,
            cached_artifact_content_hashes,
            absent_artifacts,
            dynamic_directory_contents: metadata.dynamic_outputs,
        })
    }

    fn evaluate_path_set(
        &self,
        graph: &impl PipAccessors,
        node: NodeId,
        weak: WeakFingerprint,
        path_set_hash: Digest,
    ) -> PathSetEvaluation {
        if let Some(cached) = self.path_set_cache.get(&path_set_hash) {
            return cached.clone();
        }

        let bytes = match self.content_store.get(path_set_hash) {
            Ok(bytes) => bytes,
            Err(ContentFetchError::NotFound) => {
                self.path_set_cache
                    .insert(path_set_hash, PathSetEvaluation::Poison);
                return PathSetEvaluation::Poison;
            }
            Err(ContentFetchError::Backend(source)) => {
                // Transient: the path-set blob may simply not be fetchable
                // right now. Not inserted into `path_set_cache` so the next
                // lookup (or the next candidate sharing this hash) retries
                // it instead of treating it as a permanent mismatch.
                self.log_cache_unavailable(node, &source);
                return PathSetEvaluation::Poison;
            }
            Err(ContentFetchError::Cancelled) => return PathSetEvaluation::Poison,
        };

        let evaluation = match ObservedPathSet::from_bytes(&bytes) {
            Err(_) => PathSetEvaluation::Poison,
            Ok(path_set) => match self
                .observed_processor
                .process_path_set(graph, node, &path_set)
            {
                ProcessingOutcome::Success(observed) => {
                    let reconciled = self
                        .observed_processor
                        .reconcile_path_set_hash(
                            &path_set,
                            path_set_hash,
                            path_set.unsafe_options(),
                            &self.fingerprinter,
                        )
                        .unwrap_or(path_set_hash);
                    PathSetEvaluation::Strong(self.fingerprinter.strong(
                        weak,
                        reconciled,
                        &observed,
                    ))
                }
                ProcessingOutcome::Mismatched | ProcessingOutcome::Aborted { .. } => {
                    PathSetEvaluation::Poison
                }
            },
        };

        self.path_set_cache.insert(path_set_hash, evaluation.clone());
        evaluation
    }

    fn load_metadata(
        &self,
        metadata_hash: Digest,
    ) -> Result<(PipCacheDescriptorV2Metadata, Digest), CacheMissReason> {
        let bytes = self
            .content_store
            .get(metadata_hash)
            .map_err(|_| self.miss(CacheMissReason::MissingMetadata))?;
        let metadata = bincode::deserialize(&bytes)
            .map_err(|_| self.miss(CacheMissReason::InvalidDescriptor))?;
        Ok((metadata, metadata_hash))
    }

    fn validate_descriptor_shape(
        &self,
        metadata: &PipCacheDescriptorV2Metadata,
        output_shape: OutputShape,
    ) -> Result<(), CacheMissReason> {
        if metadata.static_output_hashes.len() != output_shape.cacheable_static_outputs
            || metadata.dynamic_outputs.len() != output_shape.declared_directory_outputs
        {
            return Err(self.miss(CacheMissReason::InvalidDescriptor));
        }
        let all_required_present = metadata
            .static_output_hashes
            .iter()
            .all(|info| info.content_hash != Digest::ABSENT || info.reparse_point_info.is_some());
        if !all_required_present {
            return Err(self.miss(CacheMissReason::InvalidDescriptor));
        }
        Ok(())
    }

    fn ensure_content_available(
        &self,
        metadata: &PipCacheDescriptorV2Metadata,
        metadata_hash: Digest,
    ) -> Result<(), CacheMissReason> {
        let needs_pin = match self.config.pin_mode {
            CachePinMode::Trust => false,
            CachePinMode::VerifyCacheLookupPin => true,
            CachePinMode::MaterializeIfUnguaranteed => {
                !self.content_store.has_strong_availability_guarantee(metadata_hash)
            }
        };
        if !needs_pin {
            return Ok(());
        }
        for hash in collect_cacheable_hashes(metadata) {
            if !self.content_store.pin(hash) {
                return Err(self.miss(CacheMissReason::MissingOutputContent));
            }
        }
        Ok(())
    }

    /// Runs the publish protocol for a completed execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the path-set or metadata blob fails to serialize
    /// or store.
    pub fn publish(
        &self,
        weak: WeakFingerprint,
        path_set: &ObservedPathSet,
        observed_inputs: &ObservedInputs,
        metadata: PipCacheDescriptorV2Metadata,
        cancellation: &CancellationToken,
    ) -> Result<PublishOutcome, ContentFetchError> {
        let path_set_bytes = bincode::serialize(path_set)
            .map_err(|e| ContentFetchError::Backend(e.to_string()))?;
        if cancellation.is_cancelled() {
            return Err(ContentFetchError::Cancelled);
        }
        let path_set_hash = self.content_store.put(&path_set_bytes)?;

        let strong = self
            .fingerprinter
            .strong(weak, path_set_hash, observed_inputs);

        let metadata_bytes = bincode::serialize(&metadata)
            .map_err(|e| ContentFetchError::Backend(e.to_string()))?;
        if cancellation.is_cancelled() {
            return Err(ContentFetchError::Cancelled);
        }
        let metadata_hash = self.content_store.put(&metadata_bytes)?;

        let referenced_content = collect_referenced_content(&metadata);
        let entry = CacheEntry {
            metadata_hash,
            originating_cache: "local".to_string(),
            referenced_content,
        };

        match self.store.publish(weak, path_set_hash, strong, entry.clone()) {
            StorePublishOutcome::Published => Ok(PublishOutcome::Published(TwoPhaseCachingInfo {
                weak_fingerprint: weak,
                path_set_hash,
                strong_fingerprint: strong,
                cache_entry: entry,
            })),
            StorePublishOutcome::RejectedDueToConflict(conflicting) => {
                self.counters.record_determinism_recovered_from_cache();
                Ok(PublishOutcome::RejectedDueToConflict(conflicting))
            }
        }
    }
}

fn collect_cacheable_hashes(metadata: &PipCacheDescriptorV2Metadata) -> Vec<Digest> {
    let mut hashes: Vec<Digest> = metadata
        .static_output_hashes
        .iter()
        .filter(|info| info.is_cacheable())
        .map(|info| info.content_hash)
        .collect();
    for directory in &metadata.dynamic_outputs {
        hashes.extend(
            directory
                .iter()
                .filter(|(_, info)| info.is_cacheable())
                .map(|(_, info)| info.content_hash),
        );
    }
    if let Some(stdout) = &metadata.stdout {
        hashes.push(stdout.hash);
    }
    if let Some(stderr) = &metadata.stderr {
        hashes.push(stderr.hash);
    }
    hashes
}

fn collect_referenced_content(metadata: &PipCacheDescriptorV2Metadata) -> Vec<Digest> {
    // Outputs whose content is not actually stored (e.g. preserve-outputs
    // mode) are still referenced; the cache's pin then enforces their
    // presence on the next build.
    let mut hashes: Vec<Digest> = metadata
        .static_output_hashes
        .iter()
        .map(|info| info.content_hash)
        .collect();
    for directory in &metadata.dynamic_outputs {
        hashes.extend(directory.iter().map(|(_, info)| info.content_hash));
    }
    if let Some(stdout) = &metadata.stdout {
        hashes.push(stdout.hash);
    }
    if let Some(stderr) = &metadata.stderr {
        hashes.push(stderr.hash);
    }
    hashes
}

fn collect_absent_paths(metadata: &PipCacheDescriptorV2Metadata) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for directory in &metadata.dynamic_outputs {
        for (path, info) in directory {
            if !info.is_cacheable() {
                paths.push(path.clone());
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observed::UnsafeOptions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeContentStore {
        blobs: Mutex<std::collections::HashMap<Digest, Vec<u8>>>,
    }

    impl ContentStore for FakeContentStore {
        fn put(&self, bytes: &[u8]) -> Result<Digest, ContentFetchError> {
            let fp = Fingerprinter::new();
            let hash = fp.hash_bytes(bytes);
            self.blobs.lock().unwrap().insert(hash, bytes.to_vec());
            Ok(hash)
        }

        fn get(&self, hash: Digest) -> Result<Vec<u8>, ContentFetchError> {
            self.blobs
                .lock()
                .unwrap()
                .get(&hash)
                .cloned()
                .ok_or(ContentFetchError::NotFound)
        }

        fn pin(&self, hash: Digest) -> bool {
            self.blobs.lock().unwrap().contains_key(&hash)
        }

        fn has_strong_availability_guarantee(&self, _metadata_hash: Digest) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeTwoPhaseStore {
        entries: Mutex<Vec<(WeakFingerprint, Digest, StrongFingerprint, CacheEntry)>>,
    }

    impl TwoPhaseStore for FakeTwoPhaseStore {
        fn enumerate(&self, weak: WeakFingerprint) -> Vec<EntryRef> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(w, ..)| *w == weak)
                .map(|(_, path_set_hash, strong, entry)| EntryRef {
                    path_set_hash: *path_set_hash,
                    strong_fingerprint: *strong,
                    locality: Locality::Local,
                    originating_cache: entry.originating_cache.clone(),
                })
                .collect()
        }

        fn get_entry(
            &self,
            weak: WeakFingerprint,
            path_set_hash: Digest,
            strong: StrongFingerprint,
        ) -> Option<CacheEntry> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .find(|(w, p, s, _)| *w == weak && *p == path_set_hash && *s == strong)
                .map(|(_, _, _, entry)| entry.clone())
        }

        fn publish(
            &self,
            weak: WeakFingerprint,
            path_set_hash: Digest,
            strong: StrongFingerprint,
            entry: CacheEntry,
        ) -> StorePublishOutcome {
            let mut entries = self.entries.lock().unwrap();
            if let Some((_, _, _, existing)) = entries
                .iter()
                .find(|(w, p, s, _)| *w == weak && *p == path_set_hash && *s == strong)
            {
                return StorePublishOutcome::RejectedDueToConflict(existing.clone());
            }
            entries.push((weak, path_set_hash, strong, entry));
            StorePublishOutcome::Published
        }
    }

    fn sample_weak() -> WeakFingerprint {
        let fp = Fingerprinter::new();
        WeakFingerprint(fp.hash_bytes(b"pip declaration"))
    }

    fn empty_metadata() -> PipCacheDescriptorV2Metadata {
        PipCacheDescriptorV2Metadata {
            weak_fingerprint: "w".to_string(),
            strong_fingerprint: "s".to_string(),
            semi_stable_pip_id: 1,
            total_output_size: 0,
            static_output_hashes: Vec::new(),
            dynamic_outputs: Vec::new(),
            stdout: None,
            stderr: None,
            warning_count: 0,
        }
    }

    #[test]
    fn lookup_with_no_entries_misses_on_weak_fingerprint() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FakeContentStore::default();
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let result = cache.lookup(
            &graph,
            NodeId::new(0),
            sample_weak(),
            OutputShape {
                cacheable_static_outputs: 0,
                declared_directory_outputs: 0,
            },
            &CancellationToken::new(),
        );
        assert_eq!(result.unwrap_err(), CacheMissReason::WeakFingerprint);
        assert_eq!(counters.cache_miss_count(CacheMissReason::WeakFingerprint), 1);
    }

    #[test]
    fn publish_then_lookup_round_trips_to_a_hit() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FakeContentStore::default();
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let weak = sample_weak();
        let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
        let observed = ObservedInputProcessor::new()
            .process_live(&graph, NodeId::new(0), std::iter::empty());
        let observed_inputs = match observed {
            ProcessingOutcome::Success(inputs) => inputs,
            _ => panic!("expected success"),
        };

        let outcome = cache
            .publish(
                weak,
                &path_set,
                &observed_inputs,
                empty_metadata(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(_)));

        let hit = cache
            .lookup(
                &graph,
                NodeId::new(0),
                weak,
                OutputShape {
                    cacheable_static_outputs: 0,
                    declared_directory_outputs: 0,
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(hit.cached_artifact_content_hashes.len(), 0);
    }

    #[test]
    fn publish_conflict_is_reported_and_counted() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FakeContentStore::default();
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let weak = sample_weak();
        let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
        let observed_inputs = match ObservedInputProcessor::new()
            .process_live(&graph, NodeId::new(0), std::iter::empty())
        {
            ProcessingOutcome::Success(inputs) => inputs,
            _ => panic!("expected success"),
        };

        cache
            .publish(
                weak,
                &path_set,
                &observed_inputs,
                empty_metadata(),
                &CancellationToken::new(),
            )
            .unwrap();
        let mut second_metadata = empty_metadata();
        second_metadata.semi_stable_pip_id = 2;
        let outcome = cache
            .publish(
                weak,
                &path_set,
                &observed_inputs,
                second_metadata,
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::RejectedDueToConflict(_)));
        assert_eq!(counters.determinism_recovered_from_cache(), 1);
    }

    /// A content store whose `get` fails with [`ContentFetchError::Backend`]
    /// a fixed number of times before delegating to a real backing store.
    #[derive(Default)]
    struct FlakyContentStore {
        inner: FakeContentStore,
        remaining_backend_failures: std::sync::atomic::AtomicU32,
    }

    impl ContentStore for FlakyContentStore {
        fn put(&self, bytes: &[u8]) -> Result<Digest, ContentFetchError> {
            self.inner.put(bytes)
        }

        fn get(&self, hash: Digest) -> Result<Vec<u8>, ContentFetchError> {
            if self
                .remaining_backend_failures
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| n.checked_sub(1),
                )
                .is_ok()
            {
                return Err(ContentFetchError::Backend("backend blip".to_string()));
            }
            self.inner.get(hash)
        }

        fn pin(&self, hash: Digest) -> bool {
            self.inner.pin(hash)
        }

        fn has_strong_availability_guarantee(&self, metadata_hash: Digest) -> bool {
            self.inner.has_strong_availability_guarantee(metadata_hash)
        }
    }

    #[test]
    fn transient_backend_failure_does_not_poison_path_set() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FlakyContentStore {
            inner: FakeContentStore::default(),
            remaining_backend_failures: std::sync::atomic::AtomicU32::new(1),
        };
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let weak = sample_weak();
        let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
        let observed_inputs = match ObservedInputProcessor::new()
            .process_live(&graph, NodeId::new(0), std::iter::empty())
        {
            ProcessingOutcome::Success(inputs) => inputs,
            _ => panic!("expected success"),
        };
        cache
            .publish(
                weak,
                &path_set,
                &observed_inputs,
                empty_metadata(),
                &CancellationToken::new(),
            )
            .unwrap();

        // First lookup hits the simulated backend blip and misses, but must
        // not poison the path-set permanently.
        let first = cache.lookup(
            &graph,
            NodeId::new(0),
            weak,
            OutputShape {
                cacheable_static_outputs: 0,
                declared_directory_outputs: 0,
            },
            &CancellationToken::new(),
        );
        assert_eq!(first.unwrap_err(), CacheMissReason::StrongFingerprint);
        assert!(cache.path_set_cache.is_empty());

        // The backend has recovered; the same lookup must now hit.
        let second = cache.lookup(
            &graph,
            NodeId::new(0),
            weak,
            OutputShape {
                cacheable_static_outputs: 0,
                declared_directory_outputs: 0,
            },
            &CancellationToken::new(),
        );
        assert!(second.is_ok());
    }

    #[test]
    fn cancelled_lookup_reports_cancelled_miss() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FakeContentStore::default();
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let result = cache.lookup(
            &graph,
            NodeId::new(0),
            sample_weak(),
            OutputShape {
                cacheable_static_outputs: 0,
                declared_directory_outputs: 0,
            },
            &cancellation,
        );
        assert_eq!(result.unwrap_err(), CacheMissReason::Cancelled);
    }

    #[test]
    fn cancelled_publish_is_rejected() {
        let graph = crate::graph::GraphBuilder::new().build();
        let content_store = FakeContentStore::default();
        let store = FakeTwoPhaseStore::default();
        let config = CoreConfig::default();
        let counters = Counters::new();
        let logger = TracingLogger::new();
        let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

        let weak = sample_weak();
        let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
        let observed_inputs = match ObservedInputProcessor::new()
            .process_live(&graph, NodeId::new(0), std::iter::empty())
        {
            ProcessingOutcome::Success(inputs) => inputs,
            _ => panic!("expected success"),
        };

        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let outcome = cache.publish(
            weak,
            &path_set,
            &observed_inputs,
            empty_metadata(),
            &cancellation,
        );
        assert!(matches!(outcome, Err(ContentFetchError::Cancelled)));
    }
}
