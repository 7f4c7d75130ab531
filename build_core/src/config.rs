// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-supplied configuration for the behaviors this crate exposes as
//! tunable. No CLI, environment, or file-system state is owned here; the
//! surrounding host is responsible for populating [`CoreConfig`].

/// How aggressively the two-phase cache driver pins referenced content
/// before reporting a hit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachePinMode {
    /// Do not pin; trust the cache's availability guarantee.
    Trust,
    /// Pin every referenced hash in the content store before reporting a
    /// hit, demoting to a miss on any failure.
    VerifyCacheLookupPin,
    /// Materialize referenced content eagerly when the cache gives no
    /// strong availability guarantee for the metadata hash.
    MaterializeIfUnguaranteed,
}

/// Tunables for the build-set calculator, cache driver, and sandboxed
/// process runner.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// If set, every cache lookup immediately reports a miss with this
    /// reason tag, without consulting the backing store. Used to force a
    /// full rebuild for diagnostic purposes.
    pub artificial_cache_miss: bool,

    /// How the cache driver validates referenced content before reporting a
    /// hit.
    pub pin_mode: CachePinMode,

    /// Maximum number of internal sandbox retries for
    /// `OutputWithNoFileAccessFailed` / `MismatchedMessageCount`, summed
    /// across both reasons per pip execution.
    pub sandbox_internal_retries: u32,

    /// Maximum number of retries driven by a process's own
    /// user-configured retry exit codes.
    pub process_retries: u32,

    /// Worker-pool size for dirty-build dependency resolution (Module/All
    /// force-skip modes) and cache-lookup path-set evaluation.
    pub worker_pool_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            artificial_cache_miss: false,
            pin_mode: CachePinMode::Trust,
            sandbox_internal_retries: 5,
            process_retries: 0,
            worker_pool_size: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}
