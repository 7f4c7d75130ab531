// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Telemetry counters, passed in by reference and internally atomic so no
//! global mutable state is required.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheMissReason;

/// Per-build counters. Cheap to share by reference across worker threads.
#[derive(Debug, Default)]
pub struct Counters {
    cache_miss: [AtomicU64; CacheMissReason::COUNT],
    determinism_recovered_from_cache: AtomicU64,
    sandbox_retries: [AtomicU64; SandboxRetryReason::COUNT],
    incremental_hits: AtomicU64,
}

impl Counters {
    /// Creates a fresh, all-zero counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the counter for a specific cache-miss reason.
    pub fn record_cache_miss(&self, reason: CacheMissReason) {
        self.cache_miss[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the count recorded for a specific cache-miss reason.
    #[must_use]
    pub fn cache_miss_count(&self, reason: CacheMissReason) -> u64 {
        self.cache_miss[reason.index()].load(Ordering::Relaxed)
    }

    /// Bumps `ProcessPipDeterminismRecoveredFromCache` by one (a publish
    /// conflict that converged to the pre-existing cache entry).
    pub fn record_determinism_recovered_from_cache(&self) {
        self.determinism_recovered_from_cache
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current value of `ProcessPipDeterminismRecoveredFromCache`.
    #[must_use]
    pub fn determinism_recovered_from_cache(&self) -> u64 {
        self.determinism_recovered_from_cache.load(Ordering::Relaxed)
    }

    /// Bumps the sandbox-retry counter for `reason`.
    pub fn record_sandbox_retry(&self, reason: SandboxRetryReason) {
        self.sandbox_retries[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the sandbox-retry count for `reason`.
    #[must_use]
    pub fn sandbox_retry_count(&self, reason: SandboxRetryReason) -> u64 {
        self.sandbox_retries[reason.index()].load(Ordering::Relaxed)
    }

    /// Adds `n` incremental cache hits (process pips whose prior output was
    /// reused without re-execution) to the running total.
    pub fn add_incremental_hits(&self, n: u64) {
        self.incremental_hits.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the running total of incremental cache hits.
    #[must_use]
    pub fn incremental_hits(&self) -> u64 {
        self.incremental_hits.load(Ordering::Relaxed)
    }
}

/// Reasons a sandboxed process run may be retried internally, distinct from
/// user-specified retry exit codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SandboxRetryReason {
    /// The process produced output but the sandbox reported no file
    /// accesses for it.
    OutputWithNoFileAccessFailed,
    /// The sandbox's file-access report had a message count mismatch.
    MismatchedMessageCount,
}

impl SandboxRetryReason {
    const COUNT: usize = 2;

    #[inline]
    const fn index(self) -> usize {
        match self {
            Self::OutputWithNoFileAccessFailed => 0,
            Self::MismatchedMessageCount => 1,
        }
    }
}
