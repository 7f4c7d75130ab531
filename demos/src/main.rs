// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Walks a tiny three-node build through two incremental builds: a full
//! build from a clean slate, then a no-op rebuild once every node is
//! materialized.

use std::path::Path;
use std::sync::Arc;

use build_core::calc::{BuildSetCalculator, ForceSkipMode};
use build_core::cancel::CancellationToken;
use build_core::dirty::DirtyTracker;
use build_core::fingerprint::Digest;
use build_core::graph::GraphBuilder;
use build_core::ids::NodeId;
use build_core::pip::PipKind;
use build_core::sandbox::FileSystem;

/// Reports every path as present; stands in for a real materialized file
/// system in this walkthrough.
struct AlwaysPresent;

impl FileSystem for AlwaysPresent {
    fn exists_as_file(&self, _path: &Path) -> bool {
        true
    }

    fn materialize(&self, _path: &Path, _hash: Digest) -> Result<(), build_core::error::CoreError> {
        Ok(())
    }
}

fn main() {
    // compile <- link <- package, edges point from a pip to its dependency.
    let mut builder = GraphBuilder::new();
    let compile = builder.add_node(PipKind::Process);
    let link = builder.add_node(PipKind::Process);
    let package = builder.add_node(PipKind::Process);
    builder.add_edge(link, compile).unwrap();
    builder.add_edge(package, link).unwrap();
    let graph = Arc::new(builder.build());

    let mut tracker = DirtyTracker::new(Arc::clone(&graph));
    tracker.mark_dirty(compile, None);

    let selected = [compile, link, package];
    let modules = hashbrown::HashSet::new();

    {
        let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 4);
        let result = calc
            .compute(
                &selected,
                true,
                ForceSkipMode::Disabled,
                false,
                &modules,
                &AlwaysPresent,
                &CancellationToken::new(),
            )
            .unwrap();
        println!("first build: must_execute = {:?}", sorted(&result.must_execute));
        println!("first build: incremental_hit_count = {}", result.incremental_hit_count);

        for node in &result.must_execute {
            tracker.mark_clean(*node);
            tracker.mark_materialized(*node).unwrap();
        }
    }

    {
        let mut calc = BuildSetCalculator::new(&graph, &mut tracker, 4);
        let result = calc
            .compute(
                &selected,
                true,
                ForceSkipMode::Disabled,
                false,
                &modules,
                &AlwaysPresent,
                &CancellationToken::new(),
            )
            .unwrap();
        println!("second build: must_execute = {:?}", sorted(&result.must_execute));
        println!("second build: incremental_hit_count = {}", result.incremental_hit_count);
    }
}

fn sorted(nodes: &[NodeId]) -> Vec<NodeId> {
    let mut nodes = nodes.to_vec();
    nodes.sort_by_key(NodeId::as_u32);
    nodes
}
