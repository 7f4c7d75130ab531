// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenario tests for the build-set calculator, dirty tracker,
//! two-phase cache, and execution-result builder, run as a separate
//! integration crate against `build_core`'s public API only.

use std::path::Path;
use std::sync::{Arc, Mutex};

use build_core::cache::{
    CacheEntry, ContentFetchError, ContentStore, EntryRef, Locality, OutputShape,
    PipCacheDescriptorV2Metadata, PublishOutcome, StorePublishOutcome, TwoPhaseCache,
    TwoPhaseStore,
};
use build_core::calc::{BuildSetCalculator, ForceSkipMode};
use build_core::cancel::CancellationToken;
use build_core::config::CoreConfig;
use build_core::counters::Counters;
use build_core::dirty::DirtyTracker;
use build_core::error::CoreError;
use build_core::fingerprint::{Digest, Fingerprinter, StrongFingerprint, WeakFingerprint};
use build_core::graph::GraphBuilder;
use build_core::ids::NodeId;
use build_core::observed::{ObservedInputProcessor, ObservedPathSet, ProcessingOutcome, UnsafeOptions};
use build_core::pip::PipKind;
use build_core::result::{ExecutionResult, ResultStatus};
use build_core::sandbox::{FileSystem, TracingLogger};

struct AlwaysPresent;

impl FileSystem for AlwaysPresent {
    fn exists_as_file(&self, _path: &Path) -> bool {
        true
    }
    fn materialize(&self, _path: &Path, _hash: Digest) -> Result<(), CoreError> {
        Ok(())
    }
}

/// A single clean-materialized process with no inputs, selected under
/// `Disabled` mode, is a pure no-op that still counts as a hit.
#[test]
fn trivial_noop() {
    let mut b = GraphBuilder::new();
    let p = b.add_node(PipKind::Process);
    let graph = Arc::new(b.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_materialized(p).unwrap();

    let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 1);
    let result = calc
        .compute(
            &[p],
            false,
            ForceSkipMode::Disabled,
            false,
            &hashbrown::HashSet::new(),
            &AlwaysPresent,
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(result.scheduled.is_empty());
    assert_eq!(result.incremental_hit_count, 1);
    assert_eq!(result.clean_materialized_process_frontier_count, 1);
}

/// `A <- B <- C` (edges point depends-on), with `A, B` clean+materialized
/// and `C` dirty. Selecting `{C}` under `Disabled` mode must schedule `C`
/// and fold `B` into the clean-materialized frontier, counting two
/// incremental hits (`A`'s and `B`'s prior outputs reused).
#[test]
fn single_dirty_leaf() {
    let mut b = GraphBuilder::new();
    let a = b.add_node(PipKind::Process);
    let bb = b.add_node(PipKind::Process);
    let c = b.add_node(PipKind::Process);
    b.add_edge(bb, a).unwrap();
    b.add_edge(c, bb).unwrap();
    let graph = Arc::new(b.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_materialized(a).unwrap();
    tracker.mark_materialized(bb).unwrap();
    tracker.mark_dirty(c, None);

    let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 1);
    let result = calc
        .compute(
            &[c],
            false,
            ForceSkipMode::Disabled,
            false,
            &hashbrown::HashSet::new(),
            &AlwaysPresent,
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.must_execute, vec![c]);
    assert!(result.scheduled.contains(&c));
    assert!(result.scheduled.contains(&bb));
    assert!(!result.scheduled.contains(&a));
    assert_eq!(result.incremental_hit_count, 2);
}

/// Same chain, but `A` is dirty and dependents are scheduled. The
/// dependent-pull phase brings `B, C` into the schedule, and all three end
/// up in `must_execute`.
#[test]
fn dirty_root_cascade() {
    let mut b = GraphBuilder::new();
    let a = b.add_node(PipKind::Process);
    let bb = b.add_node(PipKind::Process);
    let c = b.add_node(PipKind::Process);
    b.add_edge(bb, a).unwrap();
    b.add_edge(c, bb).unwrap();
    let graph = Arc::new(b.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_materialized(bb).unwrap();
    tracker.mark_materialized(c).unwrap();
    tracker.mark_dirty(a, None);

    let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 1);
    let result = calc
        .compute(
            &[a],
            true,
            ForceSkipMode::Disabled,
            false,
            &hashbrown::HashSet::new(),
            &AlwaysPresent,
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(
        result.scheduled.len(),
        3,
        "dirty root cascade should reach every node in the chain"
    );
    assert!(result.must_execute.contains(&a));
    assert!(result.must_execute.contains(&bb));
    assert!(result.must_execute.contains(&c));
}

/// Two modules `M1 = {P1}`, `M2 = {P2}` with `P1 -> P2`, selecting only
/// `{P2}` (`explicitly_scheduled_modules = {M2}`) under `Module` mode while
/// `P1`'s declared output exists on disk. `P1` must be skipped; only `P2`
/// is scheduled.
#[test]
fn dirty_build_module_mode_skips_present_dependency() {
    let mut b = GraphBuilder::new();
    let p1 = b.add_node(PipKind::Process);
    let p2 = b.add_node(PipKind::Process);
    b.set_module(p1, build_core::ids::ModuleId::new(1));
    b.set_module(p2, build_core::ids::ModuleId::new(2));
    b.add_edge(p2, p1).unwrap();
    b.add_file_dependency(p2, p1, std::path::PathBuf::from("/out/p1.txt"));
    let graph = Arc::new(b.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_dirty(p2, None);

    let mut explicitly_scheduled_modules = hashbrown::HashSet::new();
    explicitly_scheduled_modules.insert(build_core::ids::ModuleId::new(2));

    let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 2);
    let result = calc
        .compute(
            &[p2],
            false,
            ForceSkipMode::Module,
            false,
            &explicitly_scheduled_modules,
            &AlwaysPresent,
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(result.scheduled.contains(&p2));
    assert!(
        !result.scheduled.contains(&p1),
        "P1's declared output exists on disk, so it should be skipped"
    );
}

struct FakeContentStore {
    blobs: Mutex<std::collections::HashMap<Digest, Vec<u8>>>,
}

impl Default for FakeContentStore {
    fn default() -> Self {
        Self {
            blobs: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl ContentStore for FakeContentStore {
    fn put(&self, bytes: &[u8]) -> Result<Digest, ContentFetchError> {
        let hash = Fingerprinter::new().hash_bytes(bytes);
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
        true
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

fn metadata_with_output(output_hash: Digest, semi_stable_pip_id: u64) -> PipCacheDescriptorV2Metadata {
    PipCacheDescriptorV2Metadata {
        weak_fingerprint: "w".to_string(),
        strong_fingerprint: "s".to_string(),
        semi_stable_pip_id,
        total_output_size: 4,
        static_output_hashes: vec![build_core::cache::FileMaterializationInfo {
            content_hash: output_hash,
            length: 4,
            file_name: None,
            reparse_point_info: None,
        }],
        dynamic_outputs: Vec::new(),
        stdout: None,
        stderr: None,
        warning_count: 0,
    }
}

/// Cache miss then publish, then a second lookup with unchanged inputs
/// returns a hit referencing the newly published content.
#[test]
fn cache_miss_then_publish_round_trips_to_a_hit() {
    let graph = GraphBuilder::new().build();
    let content_store = FakeContentStore::default();
    let store = FakeTwoPhaseStore::default();
    let config = CoreConfig::default();
    let counters = Counters::new();
    let logger = TracingLogger::new();
    let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

    let fp = Fingerprinter::new();
    let weak = WeakFingerprint(fp.hash_bytes(b"P declaration"));
    let output_shape = OutputShape {
        cacheable_static_outputs: 1,
        declared_directory_outputs: 0,
    };

    let miss = cache
        .lookup(&graph, NodeId::new(0), weak, output_shape, &CancellationToken::new())
        .unwrap_err();
    assert_eq!(miss, build_core::cache::CacheMissReason::WeakFingerprint);

    let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
    let observed_inputs = match ObservedInputProcessor::new()
        .process_live(&graph, NodeId::new(0), std::iter::empty())
    {
        ProcessingOutcome::Success(inputs) => inputs,
        other => panic!("expected success, got {other:?}"),
    };

    let output_hash = fp.hash_bytes(b"h1h2");
    let outcome = cache
        .publish(
            weak,
            &path_set,
            &observed_inputs,
            metadata_with_output(output_hash, 1),
            &CancellationToken::new(),
        )
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Published(_)));

    let hit = cache
        .lookup(&graph, NodeId::new(0), weak, output_shape, &CancellationToken::new())
        .unwrap();
    assert_eq!(hit.cached_artifact_content_hashes, vec![output_hash]);
}

/// A publish conflict converges this execution's sealed result onto the
/// conflicting entry's outputs while keeping this execution's own
/// warnings, then drives `ExecutionResult::create_converged`.
#[test]
fn cache_publish_conflict_converges_execution_result() {
    let graph = GraphBuilder::new().build();
    let content_store = FakeContentStore::default();
    let store = FakeTwoPhaseStore::default();
    let config = CoreConfig::default();
    let counters = Counters::new();
    let logger = TracingLogger::new();
    let cache = TwoPhaseCache::new(&content_store, &store, &config, &counters, &logger);

    let fp = Fingerprinter::new();
    let weak = WeakFingerprint(fp.hash_bytes(b"P declaration"));
    let path_set = ObservedPathSet::new(Vec::new(), UnsafeOptions::default());
    let observed_inputs = match ObservedInputProcessor::new()
        .process_live(&graph, NodeId::new(0), std::iter::empty())
    {
        ProcessingOutcome::Success(inputs) => inputs,
        other => panic!("expected success, got {other:?}"),
    };

    let first_hash = fp.hash_bytes(b"first-output");
    cache
        .publish(
            weak,
            &path_set,
            &observed_inputs,
            metadata_with_output(first_hash, 1),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(counters.determinism_recovered_from_cache(), 0);

    let second_hash = fp.hash_bytes(b"second-output-same-effect");
    let outcome = cache
        .publish(
            weak,
            &path_set,
            &observed_inputs,
            metadata_with_output(second_hash, 2),
            &CancellationToken::new(),
        )
        .unwrap();

    let conflicting = match outcome {
        PublishOutcome::RejectedDueToConflict(entry) => entry,
        PublishOutcome::Published(_) => panic!("expected a conflict"),
    };
    assert_eq!(counters.determinism_recovered_from_cache(), 1);

    let mut result = ExecutionResult::new(NodeId::new(0));
    result.set_status(ResultStatus::Succeeded { exit_code: 0 }).unwrap();
    result.add_warning("this execution's own warning").unwrap();
    result.seal().unwrap();

    let source = build_core::result::ConvergenceSource {
        weak_fingerprint: weak,
        output_content: vec![first_hash],
        directory_outputs: Vec::new(),
        caching_info: build_core::cache::TwoPhaseCachingInfo {
            weak_fingerprint: weak,
            path_set_hash: fp.hash_bytes(b"path-set"),
            strong_fingerprint: StrongFingerprint(fp.hash_bytes(b"strong")),
            cache_entry: conflicting,
        },
    };

    let converged = result.create_converged(&source).unwrap();
    let fields = converged.fields().unwrap();
    assert_eq!(fields.status, ResultStatus::Converged);
    assert!(fields.converged);
    assert_eq!(fields.output_content, vec![first_hash]);
    assert_eq!(fields.warnings, vec!["this execution's own warning".to_string()]);
}

/// Universal invariant: `DirtyTracker` serialization round-trips byte for
/// byte across a tracker with mixed dirty/perpetual/materialized state.
#[test]
fn dirty_tracker_serialization_round_trips() {
    let mut b = GraphBuilder::new();
    let a = b.add_node(PipKind::Process);
    let bb = b.add_node(PipKind::Process);
    b.add_edge(bb, a).unwrap();
    let graph = Arc::new(b.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_perpetual(a);
    tracker.mark_dirty(a, None);
    tracker.mark_materialized(bb).unwrap();

    let bytes = tracker.serialize();
    let restored = DirtyTracker::deserialize(Arc::clone(&graph), &bytes).unwrap();
    assert_eq!(restored.serialize(), bytes);
}
