// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! External collaborators the core consumes but does not implement:
//! sandboxed process execution, file-system probing/materialization, and
//! structured logging.

use std::path::Path;

use crate::cancel::CancellationToken;
use crate::config::CoreConfig;
use crate::counters::{Counters, SandboxRetryReason};
use crate::error::CoreError;
use crate::fingerprint::Digest;
use crate::ids::NodeId;
use crate::observed::RawObservation;

/// Exit status of a sandboxed process run.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SandboxStatus {
    /// The process ran to completion.
    Succeeded { exit_code: i32 },
    /// The process produced output but no file accesses were reported for
    /// it; eligible for a bounded internal retry.
    OutputWithNoFileAccessFailed,
    /// The sandbox's file-access report had an inconsistent message count;
    /// eligible for a bounded internal retry.
    MismatchedMessageCount,
    /// The process was cancelled mid-run.
    Cancelled,
}

/// Wall-clock and CPU time spent in the primary process (not descendants).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ProcessTimes {
    /// Wall-clock duration, in milliseconds.
    pub wall_clock_ms: u64,
    /// User-mode CPU time, in milliseconds.
    pub user_ms: u64,
    /// Kernel-mode CPU time, in milliseconds.
    pub kernel_ms: u64,
}

/// The result of running a process under sandbox monitoring.
#[derive(Clone, Debug)]
pub struct SandboxResult {
    /// How the process run concluded.
    pub status: SandboxStatus,
    /// Every file access the sandbox observed, unvalidated.
    pub observed_file_accesses: Vec<RawObservation>,
    /// Timing for the primary process.
    pub primary_process_times: ProcessTimes,
    /// Process exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
}

/// Runs a process under file-access monitoring.
///
/// Internal retries for [`SandboxStatus::OutputWithNoFileAccessFailed`] and
/// [`SandboxStatus::MismatchedMessageCount`] are the caller's responsibility
/// (bounded by [`crate::config::CoreConfig::sandbox_internal_retries`]); see
/// [`SandboxRunner`], not this trait's.
pub trait Sandbox: Send + Sync {
    /// Runs the process declared for `node`, cooperating with
    /// `cancellation`.
    fn run(
        &self,
        node: NodeId,
        cancellation: &CancellationToken,
    ) -> Result<SandboxResult, CoreError>;
}

/// Probes existence and materializes content onto the local file system.
pub trait FileSystem: Send + Sync {
    /// Returns `true` if a regular file exists at `path`.
    fn exists_as_file(&self, path: &Path) -> bool;

    /// Materializes the content addressed by `hash` at `path`.
    fn materialize(&self, path: &Path, hash: Digest) -> Result<(), CoreError>;
}

/// Drives a sandboxed process run to completion, retrying the two internal
/// sandbox failure kinds up to the configured bound (summed across both
/// reasons) before surfacing a terminal [`CoreError::SandboxFailure`]. The
/// equivalent of [`crate::cache::TwoPhaseCache`] for the `Sandbox` trait:
/// the core's own retry policy wrapped around an external collaborator.
pub struct SandboxRunner<'a> {
    sandbox: &'a dyn Sandbox,
    config: &'a CoreConfig,
    counters: &'a Counters,
}

impl<'a> SandboxRunner<'a> {
    /// Creates a runner bound to its sandbox, configuration, and counters.
    #[must_use]
    pub fn new(sandbox: &'a dyn Sandbox, config: &'a CoreConfig, counters: &'a Counters) -> Self {
        Self {
            sandbox,
            config,
            counters,
        }
    }

    /// Runs `node`, retrying `OutputWithNoFileAccessFailed` and
    /// `MismatchedMessageCount` up to `config.sandbox_internal_retries`
    /// times combined. Any other status (including `Cancelled`) is
    /// returned immediately without being retried.
    ///
    /// # Errors
    ///
    /// Propagates the sandbox's own error, or returns
    /// [`CoreError::SandboxFailure`] once retries are exhausted.
    pub fn run_with_retries(
        &self,
        node: NodeId,
        cancellation: &CancellationToken,
    ) -> Result<SandboxResult, CoreError> {
        let mut retries = 0u32;
        loop {
            let result = self.sandbox.run(node, cancellation)?;
            let reason = match result.status {
                SandboxStatus::OutputWithNoFileAccessFailed => {
                    SandboxRetryReason::OutputWithNoFileAccessFailed
                }
                SandboxStatus::MismatchedMessageCount => {
                    SandboxRetryReason::MismatchedMessageCount
                }
                SandboxStatus::Succeeded { .. } | SandboxStatus::Cancelled => return Ok(result),
            };

            if cancellation.is_cancelled() || retries >= self.config.sandbox_internal_retries {
                return Err(CoreError::SandboxFailure {
                    node,
                    status: format!("{reason:?}"),
                    retryable: false,
                });
            }

            self.counters.record_sandbox_retry(reason);
            retries += 1;
        }
    }
}

/// Coarse severity a [`LogEvent`]'s emitter assigns it, used to pick the
/// `tracing` level rather than inferring one from the free-form reason tag.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum LogSeverity {
    /// Routine, expected event (a cache miss, a scheduling decision).
    #[default]
    Info,
    /// An error-ish condition: a transient failure or an exhausted retry.
    Warn,
}

/// A numbered, machine-parseable structured event.
#[derive(Clone, Debug)]
pub struct LogEvent {
    /// Stable numeric event code.
    pub code: u32,
    /// Human-readable pip description.
    pub pip_description: String,
    /// Machine-parseable reason tag (e.g. a [`crate::cache::CacheMissReason`]
    /// name).
    pub reason_tag: String,
    /// Full message.
    pub message: String,
    /// How urgently this event should be surfaced.
    pub severity: LogSeverity,
}

/// Structured event sink.
pub trait Logger: Send + Sync {
    /// Emits one structured event.
    fn log(&self, event: LogEvent);
}

/// A [`Logger`] that forwards every event to `tracing`, at `warn` for
/// anything tagged [`LogSeverity::Warn`] and `info` otherwise.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    /// Creates a tracing-backed logger.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn log(&self, event: LogEvent) {
        match event.severity {
            LogSeverity::Warn => tracing::warn!(
                code = event.code,
                pip = %event.pip_description,
                reason = %event.reason_tag,
                "{}",
                event.message
            ),
            LogSeverity::Info => tracing::info!(
                code = event.code,
                pip = %event.pip_description,
                reason = %event.reason_tag,
                "{}",
                event.message
            ),
        }
    }
}
