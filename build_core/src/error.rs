// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error taxonomy.
//!
//! Cache errors are recovered locally and turned into misses; sandbox and
//! I/O errors surface through a sealed, failed [`crate::result::ExecutionResult`].
//! [`CoreError::GraphContract`] represents an invariant violation and is
//! never expected to occur outside of a programming error in a caller.

use std::path::PathBuf;

use crate::cache::CacheMissReason;
use crate::ids::NodeId;

/// The single error type returned by fallible operations in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An internal invariant was violated. Always fatal; logged and aborts
    /// the current operation. Never expected in correct usage.
    #[error("graph contract violated: {0}")]
    GraphContract(String),

    /// An expected cache miss; drives the MISS execution path.
    #[error("cache miss: {0}")]
    CacheMiss(#[from] CacheMissReason),

    /// The cache backend was transiently unavailable. The lookup is
    /// demoted to a miss and the build continues; this variant exists so
    /// the event can still be logged with its source error.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A sandboxed process run failed in a way that may be retried.
    #[error("sandbox failure for {node}: {status}")]
    SandboxFailure {
        /// The node whose process run failed.
        node: NodeId,
        /// Human-readable status/reason reported by the sandbox.
        status: String,
        /// Whether this failure kind is eligible for an internal retry.
        retryable: bool,
    },

    /// A path observed during execution did not belong to this path-set;
    /// expected during enumeration, never user-visible on its own.
    #[error("observed input mismatched: {}", .0.display())]
    ObservedInputMismatched(PathBuf),

    /// A path failed hard validation against declared dependencies or
    /// sandbox policy. The owning pip must fail.
    #[error("observed input aborted for {}: {reason}", .path.display())]
    ObservedInputAborted {
        /// The offending path.
        path: PathBuf,
        /// Why validation failed.
        reason: String,
    },

    /// The operation was cancelled via a [`crate::cancel::CancellationToken`].
    /// Never recovered inside the core; always propagates out.
    #[error("operation cancelled")]
    Cancelled,

    /// A file-system operation failed. Fatal unless encountered during an
    /// optional pin/probe step.
    #[error("io error at {}: {source}", .path.display())]
    IoError {
        /// Path the failing operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
