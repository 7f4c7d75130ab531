// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Build-set calculator: turns a filter-selected node set into the set of
//! nodes to schedule, classifying each as must-execute, clean-materialized
//! frontier, or skipped.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use hashbrown::HashSet;
use rayon::prelude::*;

use crate::bitset::{ConcurrentNodeSet, NodeSet};
use crate::cancel::CancellationToken;
use crate::dirty::DirtyTracker;
use crate::error::CoreError;
use crate::graph::Graph;
use crate::ids::{ModuleId, NodeId};
use crate::pip::{DirectoryKind, PipAccessors, PipKind};
use crate::sandbox::FileSystem;

/// Which force-skip-dependencies ("dirty build") mode governs Phase C.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ForceSkipMode {
    /// Normal incremental scheduling: dependencies are scheduled until
    /// clean and materialized.
    #[default]
    Disabled,
    /// Dirty build: dependencies outside explicitly scheduled modules are
    /// skipped as long as their required inputs are already present.
    Module,
    /// Dirty build: every dependency is treated the same way as `Module`
    /// mode's non-explicit case (no module set is consulted).
    All,
}

/// Why a node was pulled into the schedule during missing-input resolution.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MissingInputReason {
    /// A declared file input does not exist on disk.
    MissingOutputs,
    /// One or more members of a statically sealed directory are missing.
    SealContentsMissing,
    /// A dynamic (opaque) directory's contents are not statically knowable,
    /// so its producer is always scheduled.
    DynamicDirectory,
    /// An `Ipc` pip's dependency is always scheduled: IPC servers may
    /// observe the presence of upstream artifacts.
    IpcPipDependent,
}

/// One recorded missing-input decision, for diagnostics.
#[derive(Clone, Debug)]
pub struct MissingInputRecord {
    /// The node that was pulled into the schedule.
    pub producer: NodeId,
    /// The path that was found missing, if applicable.
    pub path: Option<PathBuf>,
    /// The node whose input declaration triggered this check.
    pub consumer: NodeId,
    /// Why `producer` was scheduled.
    pub reason: MissingInputReason,
}

/// Output of [`BuildSetCalculator::compute`].
#[derive(Clone, Debug, Default)]
pub struct ScheduledNodesResult {
    /// Every node the execution engine must visit: both nodes that will
    /// re-run and clean-materialized frontier nodes that only need to be
    /// seen so their outputs are accounted for.
    pub scheduled: Vec<NodeId>,
    /// The subset of `scheduled` that will actually (re-)execute.
    pub must_execute: Vec<NodeId>,
    /// Clean-materialized nodes at the boundary between must-execute and
    /// can-skip.
    pub clean_materialized_frontier: Vec<NodeId>,
    /// Count of process pips whose prior output was reused without
    /// re-execution.
    pub incremental_hit_count: usize,
    /// Count of process pips in the clean-materialized frontier.
    pub clean_materialized_process_frontier_count: usize,
    /// Diagnostics from missing-input resolution (`Module`/`All` modes
    /// only; empty in `Disabled` mode).
    pub missing_input_records: Vec<MissingInputRecord>,
}

impl ScheduledNodesResult {
    fn no_op(selected: &[NodeId], graph: &Graph) -> Self {
        let process_count = selected
            .iter()
            .filter(|&&n| graph.pip_kind(n).is_process())
            .count();
        Self {
            scheduled: Vec::new(),
            must_execute: Vec::new(),
            clean_materialized_frontier: Vec::new(),
            incremental_hit_count: process_count,
            clean_materialized_process_frontier_count: process_count,
            missing_input_records: Vec::new(),
        }
    }
}

/// Computes the nodes to schedule given a graph, a dirty tracker, and a
/// filter-selected node set.
pub struct BuildSetCalculator<'a> {
    graph: &'a Graph,
    tracker: &'a mut DirtyTracker,
    worker_pool_size: usize,
}

impl<'a> BuildSetCalculator<'a> {
    /// Creates a calculator bound to a graph, its dirty tracker, and the
    /// worker-pool size used for `Module`/`All` mode missing-input
    /// resolution.
    #[must_use]
    pub fn new(graph: &'a Graph, tracker: &'a mut DirtyTracker, worker_pool_size: usize) -> Self {
        Self {
            graph,
            tracker,
            worker_pool_size: worker_pool_size.max(1),
        }
    }

    /// Runs the full build-set calculation.
    ///
    /// # Errors
    ///
    /// Propagates the first unexpected error encountered by a
    /// missing-input-resolution worker, or [`CoreError::Cancelled`] if
    /// `cancellation` is already set or becomes set while workers are
    /// resolving missing inputs.
    pub fn compute(
        &mut self,
        selected: &[NodeId],
        schedule_dependents: bool,
        force_skip_mode: ForceSkipMode,
        schedule_meta_pips: bool,
        explicitly_scheduled_modules: &HashSet<ModuleId>,
        filesystem: &dyn FileSystem,
        cancellation: &CancellationToken,
    ) -> Result<ScheduledNodesResult, CoreError> {
        if cancellation.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        // Phase A: dirty classification.
        let mut dirty_schedule = NodeSet::with_capacity(self.graph.len());
        let mut dirty_count = 0usize;
        for &n in selected {
            if self.tracker.is_dirty(n) {
                dirty_count += 1;
                dirty_schedule.insert(n);
            } else if !self.tracker.is_materialized(n) {
                dirty_count += 1;
                if self.graph.pip_kind(n).is_process() {
                    self.tracker.mark_dirty(n, None);
                }
                dirty_schedule.insert(n);
            }
        }

        if dirty_count == 0 {
            return Ok(ScheduledNodesResult::no_op(selected, self.graph));
        }

        // Phase B: build cone.
        if schedule_dependents {
            let mut queue: VecDeque<NodeId> = selected.iter().copied().collect();
            let mut seen: NodeSet = NodeSet::with_capacity(self.graph.len());
            for &n in selected {
                seen.insert(n);
            }
            while let Some(n) = queue.pop_front() {
                for &dependent in self.graph.incoming(n) {
                    if self.graph.pip_kind(dependent).is_meta_pip() {
                        continue;
                    }
                    if seen.insert(dependent) {
                        dirty_schedule.insert(dependent);
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let cone = build_cone(self.graph, dirty_schedule.iter());

        // Phase C: resolution.
        let (mut scheduled, frontier, missing_input_records) = match force_skip_mode {
            ForceSkipMode::Disabled => {
                let frontier = self.schedule_until_clean_and_materialized(&mut dirty_schedule, &cone);
                (dirty_schedule, frontier, Vec::new())
            }
            ForceSkipMode::Module | ForceSkipMode::All => {
                let module_mode = matches!(force_skip_mode, ForceSkipMode::Module);
                let (resolved, records) = self.schedule_until_required_inputs_present(
                    dirty_schedule.iter().collect::<Vec<_>>(),
                    &cone,
                    module_mode,
                    explicitly_scheduled_modules,
                    filesystem,
                    cancellation,
                )?;
                let mut scheduled = dirty_schedule;
                scheduled.union_with(&resolved);
                // Include dependents within the cone for counter
                // correctness; they are skipped at execution time.
                include_cone_dependents(self.graph, &mut scheduled, &cone);
                (scheduled, NodeSet::with_capacity(self.graph.len()), records)
            }
        };

        scheduled.union_with(&frontier);

        // Phase D: metapip frontier.
        if schedule_meta_pips {
            include_metapip_frontier(self.graph, &mut scheduled);
        }

        let must_execute: Vec<NodeId> = scheduled
            .iter()
            .filter(|&n| self.tracker.is_dirty(n))
            .collect();

        let incremental_hit_count = match force_skip_mode {
            ForceSkipMode::Disabled => {
                let processes_in_cone = cone
                    .iter()
                    .filter(|&n| self.graph.pip_kind(n).is_process())
                    .count();
                let scheduled_processes = scheduled
                    .iter()
                    .filter(|&n| self.graph.pip_kind(n).is_process())
                    .count();
                let frontier_processes = frontier
                    .iter()
                    .filter(|&n| self.graph.pip_kind(n).is_process())
                    .count();
                processes_in_cone
                    .saturating_sub(scheduled_processes)
                    .saturating_add(frontier_processes)
            }
            ForceSkipMode::Module | ForceSkipMode::All => 0,
        };

        let clean_materialized_process_frontier_count = frontier
            .iter()
            .filter(|&n| self.graph.pip_kind(n).is_process())
            .count();

        Ok(ScheduledNodesResult {
            scheduled: scheduled.iter().collect(),
            must_execute,
            clean_materialized_frontier: frontier.iter().collect(),
            incremental_hit_count,
            clean_materialized_process_frontier_count,
            missing_input_records,
        })
    }

    fn schedule_until_clean_and_materialized(
        &mut self,
        dirty_schedule: &mut NodeSet,
        cone: &NodeSet,
    ) -> NodeSet {
        let mut frontier = NodeSet::with_capacity(self.graph.len());
        let mut queue: VecDeque<NodeId> = dirty_schedule.iter().collect();

        while let Some(n) = queue.pop_front() {
            for &dep in self.graph.outgoing(n) {
                if !cone.contains(dep) {
                    continue;
                }
                if self.tracker.is_clean_and_materialized(dep) && !self.graph.is_rewritten(dep) {
                    frontier.insert(dep);
                } else if dirty_schedule.insert(dep) {
                    if self.graph.pip_kind(dep).is_process() {
                        self.tracker.mark_dirty(dep, None);
                    }
                    if self.graph.pip_kind(dep) != PipKind::HashSourceFile {
                        queue.push_back(dep);
                    }
                }
            }
        }

        frontier
    }

    fn schedule_until_required_inputs_present(
        &self,
        initial: Vec<NodeId>,
        cone: &NodeSet,
        module_mode: bool,
        explicitly_scheduled_modules: &HashSet<ModuleId>,
        filesystem: &dyn FileSystem,
        cancellation: &CancellationToken,
    ) -> Result<(NodeSet, Vec<MissingInputRecord>), CoreError> {
        let visited = ConcurrentNodeSet::with_capacity(self.graph.len());
        let existence_cache: DashMap<PathBuf, bool> = DashMap::new();
        let records: Mutex<Vec<MissingInputRecord>> = Mutex::new(Vec::new());
        let error_slot: Mutex<Option<CoreError>> = Mutex::new(None);
        let pending = AtomicUsize::new(0);
        let done = AtomicBool::new(false);

        let (sender, receiver) = crossbeam_channel::unbounded::<NodeId>();
        for &n in &initial {
            if visited.try_insert(n) && cone.contains(n) {
                pending.fetch_add(1, Ordering::SeqCst);
                let _ = sender.send(n);
            }
        }
        if pending.load(Ordering::SeqCst) == 0 {
            done.store(true, Ordering::SeqCst);
        }

        std::thread::scope(|scope| {
            for _ in 0..self.worker_pool_size {
                let sender = sender.clone();
                let receiver = receiver.clone();
                let visited = &visited;
                let existence_cache = &existence_cache;
                let records = &records;
                let error_slot = &error_slot;
                let pending = &pending;
                let done = &done;
                let cancellation = cancellation.clone();
                scope.spawn(move || {
                    loop {
                        if done.load(Ordering::SeqCst) {
                            break;
                        }
                        if cancellation.is_cancelled() {
                            let mut slot = error_slot.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(CoreError::Cancelled);
                            }
                            done.store(true, Ordering::SeqCst);
                            break;
                        }
                        match receiver.recv_timeout(Duration::from_millis(2)) {
                            Ok(node) => {
                                if error_slot.lock().unwrap().is_some() {
                                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                                        done.store(true, Ordering::SeqCst);
                                    }
                                    continue;
                                }
                                let outcome = process_missing_inputs(
                                    self.graph,
                                    node,
                                    module_mode,
                                    explicitly_scheduled_modules,
                                    existence_cache,
                                    filesystem,
                                    records,
                                );
                                match outcome {
                                    Ok(new_nodes) => {
                                        for nn in new_nodes {
                                            if cone.contains(nn) && visited.try_insert(nn) {
                                                pending.fetch_add(1, Ordering::SeqCst);
                                                let _ = sender.send(nn);
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        *error_slot.lock().unwrap() = Some(e);
                                    }
                                }
                                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                                    done.store(true, Ordering::SeqCst);
                                }
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                if pending.load(Ordering::SeqCst) == 0 {
                                    done.store(true, Ordering::SeqCst);
                                }
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                });
            }
        });

        if let Some(err) = error_slot.into_inner().unwrap() {
            return Err(err);
        }

        Ok((visited.into_node_set(), records.into_inner().unwrap()))
    }
}

#[allow(clippy::too_many_arguments)]
fn process_missing_inputs(
    graph: &Graph,
    node: NodeId,
    module_mode: bool,
    explicitly_scheduled_modules: &HashSet<ModuleId>,
    existence_cache: &DashMap<PathBuf, bool>,
    filesystem: &dyn FileSystem,
    records: &Mutex<Vec<MissingInputRecord>>,
) -> Result<Vec<NodeId>, CoreError> {
    let mut to_schedule = Vec::new();

    if module_mode {
        for &dep in graph.outgoing(node) {
            if let Some(module) = graph.module_of(dep) {
                if explicitly_scheduled_modules.contains(&module) {
                    to_schedule.push(dep);
                }
            }
        }
    }

    match graph.pip_kind(node) {
        PipKind::Ipc => {
            for &dep in graph.outgoing(node) {
                to_schedule.push(dep);
                records.lock().unwrap().push(MissingInputRecord {
                    producer: dep,
                    path: None,
                    consumer: node,
                    reason: MissingInputReason::IpcPipDependent,
                });
            }
        }
        PipKind::WriteFile => {
            // Materialized on demand by any dependent; nothing to probe.
        }
        _ => {
            for file_dep in graph.file_dependencies(node) {
                let exists = probe_exists(existence_cache, filesystem, &file_dep.path);
                if !exists {
                    to_schedule.push(file_dep.producer);
                    records.lock().unwrap().push(MissingInputRecord {
                        producer: file_dep.producer,
                        path: Some((*file_dep.path).clone()),
                        consumer: node,
                        reason: MissingInputReason::MissingOutputs,
                    });
                }
            }
            for dir_dep in graph.directory_dependencies(node) {
                match dir_dep.kind {
                    DirectoryKind::Dynamic => {
                        to_schedule.push(dir_dep.producer);
                        records.lock().unwrap().push(MissingInputRecord {
                            producer: dir_dep.producer,
                            path: None,
                            consumer: node,
                            reason: MissingInputReason::DynamicDirectory,
                        });
                    }
                    DirectoryKind::Static => {
                        let missing = dir_dep
                            .sealed_contents
                            .iter()
                            .any(|p| !probe_exists(existence_cache, filesystem, p));
                        if missing {
                            to_schedule.push(dir_dep.producer);
                            records.lock().unwrap().push(MissingInputRecord {
                                producer: dir_dep.producer,
                                path: None,
                                consumer: node,
                                reason: MissingInputReason::SealContentsMissing,
                            });
                        }
                    }
                }
            }
        }
    }

    Ok(to_schedule)
}

fn probe_exists(cache: &DashMap<PathBuf, bool>, filesystem: &dyn FileSystem, path: &std::path::Path) -> bool {
    if let Some(cached) = cache.get(path) {
        return *cached;
    }
    let exists = filesystem.exists_as_file(path);
    cache.insert(path.to_path_buf(), exists);
    exists
}

fn build_cone(graph: &Graph, roots: impl Iterator<Item = NodeId>) -> NodeSet {
    let visited = ConcurrentNodeSet::with_capacity(graph.len());
    let mut frontier: Vec<NodeId> = roots.filter(|&n| visited.try_insert(n)).collect();

    while !frontier.is_empty() {
        frontier = frontier
            .par_iter()
            .flat_map(|&n| graph.outgoing(n).par_iter().copied())
            .filter(|&n| visited.try_insert(n))
            .collect();
    }

    visited.into_node_set()
}

fn include_cone_dependents(graph: &Graph, scheduled: &mut NodeSet, cone: &NodeSet) {
    let mut queue: VecDeque<NodeId> = scheduled.iter().collect();
    while let Some(n) = queue.pop_front() {
        for &dependent in graph.incoming(n) {
            if cone.contains(dependent) && scheduled.insert(dependent) {
                queue.push_back(dependent);
            }
        }
    }
}

fn include_metapip_frontier(graph: &Graph, scheduled: &mut NodeSet) {
    let frontier: Vec<NodeId> = scheduled
        .iter()
        .flat_map(|n| graph.outgoing(n).iter().copied())
        .filter(|&d| graph.pip_kind(d).is_meta_pip())
        .collect();

    let mut queue: VecDeque<NodeId> = VecDeque::new();
    for n in frontier {
        if scheduled.insert(n) {
            queue.push_back(n);
        }
    }
    while let Some(n) = queue.pop_front() {
        for &dependent in graph.incoming(n) {
            // Metapip dependents are assumed to be metapips themselves.
            if scheduled.insert(dependent) {
                queue.push_back(dependent);
            }
        }
    }
}
