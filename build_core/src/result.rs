// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-pip execution result: a builder that transitions exactly once into an
//! immutable, sealed record.
//!
//! An [`ExecutionResult`] starts in the `Unsealed` state and accepts writes
//! through its `set_*`/`add_*` methods. [`ExecutionResult::seal`] freezes it:
//! further writes are rejected and the read accessors become available.
//! Sealing is idempotent, matching [`crate::dirty::PendingUpdates::apply`]'s
//! idempotence.

use std::path::PathBuf;

use crate::cache::{FileMaterializationInfo, TwoPhaseCachingInfo};
use crate::error::CoreError;
use crate::fingerprint::{Digest, WeakFingerprint};
use crate::ids::NodeId;
use crate::observed::{ObservedPathSet, RawObservation};
use crate::sandbox::{ProcessTimes, SandboxResult};

/// Terminal disposition of a pip's execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResultStatus {
    /// The pip ran (or was served from cache) and succeeded.
    Succeeded {
        /// Process exit code; `0` for non-process pips and cache hits.
        exit_code: i32,
    },
    /// The pip failed; exactly one error was logged for it.
    Failed,
    /// The pip was cancelled mid-run.
    Cancelled,
    /// The pip's outputs were adopted from a pre-existing cache entry after
    /// a publish conflict ([`ExecutionResult::create_converged`]).
    Converged,
}

/// Directory outputs, indexed the same way as
/// [`crate::cache::PipCacheDescriptorV2Metadata::dynamic_outputs`].
pub type DirectoryOutputs = Vec<Vec<(PathBuf, FileMaterializationInfo)>>;

/// Inputs adopted from a pre-existing cache entry on publish conflict.
///
/// [`crate::cache::CacheEntry`] only carries a metadata hash and referenced
/// content hashes; the host is responsible for resolving those into the
/// concrete output content and caching-info fields before calling
/// [`ExecutionResult::create_converged`].
#[derive(Clone, Debug)]
pub struct ConvergenceSource {
    /// The conflicting entry's weak fingerprint.
    pub weak_fingerprint: WeakFingerprint,
    /// The conflicting entry's static output content hashes.
    pub output_content: Vec<Digest>,
    /// The conflicting entry's directory outputs.
    pub directory_outputs: DirectoryOutputs,
    /// The fingerprint tuple the conflicting entry resolved to.
    pub caching_info: TwoPhaseCachingInfo,
}

#[derive(Clone, Debug, Default)]
struct MutableFields {
    status: Option<ResultStatus>,
    output_content: Vec<Digest>,
    directory_outputs: DirectoryOutputs,
    path_set: Option<ObservedPathSet>,
    caching_info: Option<TwoPhaseCachingInfo>,
    warnings: Vec<String>,
    dynamic_observations: Vec<RawObservation>,
    sandbox_result: Option<SandboxResult>,
    file_access_violations: Vec<PathBuf>,
    weak_fingerprint: Option<WeakFingerprint>,
    converged: bool,
}

/// The frozen contents of a sealed [`ExecutionResult`].
#[derive(Clone, Debug)]
pub struct SealedFields {
    /// Terminal status.
    pub status: ResultStatus,
    /// Content hashes of every cacheable static output.
    pub output_content: Vec<Digest>,
    /// Directory outputs.
    pub directory_outputs: DirectoryOutputs,
    /// The observed path-set collected during execution, if any (absent for
    /// a pure cache hit that never ran a live sandbox).
    pub path_set: Option<ObservedPathSet>,
    /// The two-phase fingerprint tuple this execution resolved to, if
    /// caching was attempted.
    pub caching_info: Option<TwoPhaseCachingInfo>,
    /// Warning messages collected during execution.
    pub warnings: Vec<String>,
    /// Dynamic (live, unvalidated) file-access observations.
    pub dynamic_observations: Vec<RawObservation>,
    /// Timing for the primary process; zeroed for a pure cache hit.
    pub performance: ProcessTimes,
    /// Paths that violated declared dependency permissions.
    pub file_access_violations: Vec<PathBuf>,
    /// Paths written to a declared dynamic directory output, shared across
    /// this pip and any other producer of the same directory. Computed from
    /// `directory_outputs` when no live sandbox result was reported (cache
    /// hit); otherwise taken from the sandbox's own observations.
    pub shared_dynamic_directory_write_accesses: Vec<PathBuf>,
    /// Weak fingerprint used for this pip's cache lookup, if any.
    pub weak_fingerprint: Option<WeakFingerprint>,
    /// `true` if this result's outputs were adopted from a conflicting
    /// cache entry via [`ExecutionResult::create_converged`].
    pub converged: bool,
}

enum State {
    Unsealed(MutableFields),
    Sealed(SealedFields),
}

/// Per-pip execution result: builder while `Unsealed`, immutable once
/// [`ExecutionResult::seal`] is called.
pub struct ExecutionResult {
    node: NodeId,
    state: State,
}

fn contract_violation(what: &str) -> CoreError {
    CoreError::GraphContract(what.to_string())
}

impl ExecutionResult {
    /// Creates a new, unsealed result for `node`.
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: State::Unsealed(MutableFields::default()),
        }
    }

    /// Returns the pip this result belongs to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns `true` once [`ExecutionResult::seal`] has been called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Sealed(_))
    }

    fn unsealed_mut(&mut self) -> Result<&mut MutableFields, CoreError> {
        match &mut self.state {
            State::Unsealed(fields) => Ok(fields),
            State::Sealed(_) => Err(contract_violation(
                "attempted to mutate a sealed ExecutionResult",
            )),
        }
    }

    /// Sets the terminal status. Required before [`ExecutionResult::seal`].
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_status(&mut self, status: ResultStatus) -> Result<(), CoreError> {
        self.unsealed_mut()?.status = Some(status);
        Ok(())
    }

    /// Appends a static output's content hash.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn add_output_content(&mut self, hash: Digest) -> Result<(), CoreError> {
        self.unsealed_mut()?.output_content.push(hash);
        Ok(())
    }

    /// Sets the full directory-outputs table.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_directory_outputs(&mut self, outputs: DirectoryOutputs) -> Result<(), CoreError> {
        self.unsealed_mut()?.directory_outputs = outputs;
        Ok(())
    }

    /// Sets the observed path-set collected during execution.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_path_set(&mut self, path_set: ObservedPathSet) -> Result<(), CoreError> {
        self.unsealed_mut()?.path_set = Some(path_set);
        Ok(())
    }

    /// Sets the two-phase caching info this execution resolved to.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_caching_info(&mut self, info: TwoPhaseCachingInfo) -> Result<(), CoreError> {
        self.unsealed_mut()?.caching_info = Some(info);
        Ok(())
    }

    /// Appends a warning message.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn add_warning(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        self.unsealed_mut()?.warnings.push(message.into());
        Ok(())
    }

    /// Appends a dynamic (live) file-access observation.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn add_dynamic_observation(&mut self, observation: RawObservation) -> Result<(), CoreError> {
        self.unsealed_mut()?.dynamic_observations.push(observation);
        Ok(())
    }

    /// Records the raw sandbox result for a live execution. Absent for a
    /// pure cache hit.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_sandbox_result(&mut self, result: SandboxResult) -> Result<(), CoreError> {
        self.unsealed_mut()?.sandbox_result = Some(result);
        Ok(())
    }

    /// Appends a path that violated its declared dependency permissions.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn add_file_access_violation(&mut self, path: PathBuf) -> Result<(), CoreError> {
        self.unsealed_mut()?.file_access_violations.push(path);
        Ok(())
    }

    /// Sets the weak fingerprint used for this pip's cache lookup.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if already sealed.
    pub fn set_weak_fingerprint(&mut self, weak: WeakFingerprint) -> Result<(), CoreError> {
        self.unsealed_mut()?.weak_fingerprint = Some(weak);
        Ok(())
    }

    /// Freezes this result.
    ///
    /// Idempotent: calling `seal` on an already-sealed result is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if [`ExecutionResult::set_status`]
    /// was never called.
    pub fn seal(&mut self) -> Result<(), CoreError> {
        let fields = match &mut self.state {
            State::Sealed(_) => return Ok(()),
            State::Unsealed(fields) => std::mem::take(fields),
        };

        let status = fields
            .status
            .ok_or_else(|| contract_violation("seal() called before set_status()"))?;

        let performance = fields
            .sandbox_result
            .as_ref()
            .map(|r| r.primary_process_times)
            .unwrap_or_default();

        let shared_dynamic_directory_write_accesses = match &fields.sandbox_result {
            None => fields
                .directory_outputs
                .iter()
                .flatten()
                .map(|(path, _)| path.clone())
                .collect(),
            Some(sandbox_result) => sandbox_result
                .observed_file_accesses
                .iter()
                .map(|obs| obs.path.clone())
                .collect(),
        };

        self.state = State::Sealed(SealedFields {
            status,
            output_content: fields.output_content,
            directory_outputs: fields.directory_outputs,
            path_set: fields.path_set,
            caching_info: fields.caching_info,
            warnings: fields.warnings,
            dynamic_observations: fields.dynamic_observations,
            performance,
            file_access_violations: fields.file_access_violations,
            shared_dynamic_directory_write_accesses,
            weak_fingerprint: fields.weak_fingerprint,
            converged: fields.converged,
        });
        Ok(())
    }

    fn sealed(&self) -> Result<&SealedFields, CoreError> {
        match &self.state {
            State::Sealed(fields) => Ok(fields),
            State::Unsealed(_) => Err(contract_violation(
                "attempted to read an unsealed ExecutionResult",
            )),
        }
    }

    /// Returns the sealed fields, once sealed.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if not yet sealed.
    pub fn fields(&self) -> Result<&SealedFields, CoreError> {
        self.sealed()
    }

    /// Returns a copy of this result with its status swapped for `status`.
    /// `self` must already be sealed; the returned result is sealed too.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if `self` is not yet sealed.
    pub fn clone_with_result(&self, status: ResultStatus) -> Result<Self, CoreError> {
        let mut sealed = self.sealed()?.clone();
        sealed.status = status;
        Ok(Self {
            node: self.node,
            state: State::Sealed(sealed),
        })
    }

    /// Returns a copy of this result that adopts `source`'s output content,
    /// directory outputs, and caching info, while keeping this execution's
    /// own warnings, dynamic observations, performance, and file-access
    /// violations. `self` must already be sealed; the returned result is
    /// sealed too, with `status = Converged` and `converged = true`.
    ///
    /// # Errors
    ///
    /// Returns a contract-violation error if `self` is not yet sealed.
    pub fn create_converged(&self, source: &ConvergenceSource) -> Result<Self, CoreError> {
        let mut sealed = self.sealed()?.clone();
        sealed.status = ResultStatus::Converged;
        sealed.output_content = source.output_content.clone();
        sealed.directory_outputs = source.directory_outputs.clone();
        sealed.caching_info = Some(source.caching_info.clone());
        sealed.weak_fingerprint = Some(source.weak_fingerprint);
        sealed.converged = true;
        Ok(Self {
            node: self.node,
            state: State::Sealed(sealed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsealed_reads_are_rejected() {
        let result = ExecutionResult::new(NodeId::new(0));
        assert!(result.fields().is_err());
    }

    #[test]
    fn sealed_writes_are_rejected() {
        let mut result = ExecutionResult::new(NodeId::new(0));
        result.set_status(ResultStatus::Succeeded { exit_code: 0 }).unwrap();
        result.seal().unwrap();
        assert!(result.add_warning("late").is_err());
    }

    #[test]
    fn seal_requires_status() {
        let mut result = ExecutionResult::new(NodeId::new(0));
        assert!(result.seal().is_err());
    }

    #[test]
    fn seal_is_idempotent() {
        let mut result = ExecutionResult::new(NodeId::new(0));
        result.set_status(ResultStatus::Succeeded { exit_code: 0 }).unwrap();
        result.add_output_content(Digest::ABSENT).unwrap();
        result.seal().unwrap();
        let first = result.fields().unwrap().output_content.clone();
        result.seal().unwrap();
        let second = result.fields().unwrap().output_content.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn clone_with_result_swaps_status_only() {
        let mut result = ExecutionResult::new(NodeId::new(0));
        result.set_status(ResultStatus::Succeeded { exit_code: 0 }).unwrap();
        result.add_output_content(Digest::ABSENT).unwrap();
        result.seal().unwrap();

        let failed = result.clone_with_result(ResultStatus::Failed).unwrap();
        assert_eq!(failed.fields().unwrap().status, ResultStatus::Failed);
        assert_eq!(
            failed.fields().unwrap().output_content,
            result.fields().unwrap().output_content
        );
    }

    #[test]
    fn create_converged_adopts_cache_outputs_but_keeps_local_warnings() {
        use crate::cache::CacheEntry;

        let mut result = ExecutionResult::new(NodeId::new(0));
        result.set_status(ResultStatus::Succeeded { exit_code: 0 }).unwrap();
        result.add_warning("local warning").unwrap();
        result.seal().unwrap();

        let fp = crate::fingerprint::Fingerprinter::new();
        let weak = WeakFingerprint(fp.hash_bytes(b"w"));
        let source = ConvergenceSource {
            weak_fingerprint: weak,
            output_content: vec![fp.hash_bytes(b"output")],
            directory_outputs: Vec::new(),
            caching_info: TwoPhaseCachingInfo {
                weak_fingerprint: weak,
                path_set_hash: fp.hash_bytes(b"path-set"),
                strong_fingerprint: crate::fingerprint::StrongFingerprint(fp.hash_bytes(b"strong")),
                cache_entry: CacheEntry {
                    metadata_hash: fp.hash_bytes(b"metadata"),
                    originating_cache: "remote".to_string(),
                    referenced_content: Vec::new(),
                },
            },
        };

        let converged = result.create_converged(&source).unwrap();
        let converged_fields = converged.fields().unwrap();
        assert_eq!(converged_fields.status, ResultStatus::Converged);
        assert!(converged_fields.converged);
        assert_eq!(converged_fields.output_content, source.output_content);
        assert_eq!(converged_fields.warnings, vec!["local warning".to_string()]);
    }
}
