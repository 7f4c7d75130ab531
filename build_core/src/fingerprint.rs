// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Weak and strong content fingerprints.
//!
//! The hashing algorithm itself is an implementation detail callers never
//! observe directly: every public fingerprint type exposes only its
//! length-prefixed serialized form and equality, never the raw digest type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-byte content digest, serialized as a length-prefixed byte string.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The sentinel hash representing "no file" (used to mark a
    /// non-cacheable, intentionally absent output).
    pub const ABSENT: Self = Self([0u8; 32]);

    fn from_hasher(hasher: blake3::Hasher) -> Self {
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Serializes this digest as a little-endian `u32` length followed by
    /// the raw bytes.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.0);
    }

    /// Deserializes a digest previously written by [`Digest::serialize`].
    #[must_use]
    pub fn deserialize(bytes: &[u8], offset: &mut usize) -> Option<Self> {
        let len_bytes = bytes.get(*offset..*offset + 4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().ok()?) as usize;
        *offset += 4;
        if len != 32 {
            return None;
        }
        let digest_bytes = bytes.get(*offset..*offset + 32)?;
        *offset += 32;
        let mut buf = [0u8; 32];
        buf.copy_from_slice(digest_bytes);
        Some(Self(buf))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex(&self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash of a pip's declaration, declared inputs, environment, and salts.
/// Identifies candidate cache entries.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WeakFingerprint(pub Digest);

impl fmt::Display for WeakFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weak:{}", self.0)
    }
}

/// Hash of `(weak fingerprint, path set, observed inputs)`. Identifies a
/// specific prior execution with matching observed inputs.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct StrongFingerprint(pub Digest);

impl fmt::Display for StrongFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strong:{}", self.0)
    }
}

/// The declaration-level attributes a weak fingerprint is computed over.
#[derive(Debug)]
pub struct ProcessFingerprintInput<'a> {
    /// Path to the process executable.
    pub executable: &'a str,
    /// Command-line arguments, in declaration order.
    pub arguments: &'a [String],
    /// Environment variables that affect the process's behavior, in
    /// declaration order (not the ambient environment).
    pub environment: &'a [(String, String)],
    /// Content hashes of statically declared inputs, in declaration order.
    pub declared_input_hashes: &'a [Digest],
    /// Extra salts (tool version, fingerprint-format version, ...).
    pub salts: &'a [String],
}

/// Computes weak and strong fingerprints.
#[derive(Debug, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    /// Creates a fingerprinter. Stateless; exists for symmetry with the
    /// other component drivers and as an extension point.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Computes the weak fingerprint of a process pip declaration.
    #[must_use]
    pub fn weak(&self, input: &ProcessFingerprintInput<'_>) -> WeakFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(input.executable.as_bytes());
        for arg in input.arguments {
            hasher.update(b"\0arg\0");
            hasher.update(arg.as_bytes());
        }
        for (key, value) in input.environment {
            hasher.update(b"\0env\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        for hash in input.declared_input_hashes {
            hasher.update(b"\0in\0");
            hasher.update(hash.as_bytes());
        }
        for salt in input.salts {
            hasher.update(b"\0salt\0");
            hasher.update(salt.as_bytes());
        }
        WeakFingerprint(Digest::from_hasher(hasher))
    }

    /// Computes the strong fingerprint from a weak fingerprint, the
    /// path-set's content hash, and the validated observed inputs.
    #[must_use]
    pub fn strong(
        &self,
        weak: WeakFingerprint,
        path_set_hash: Digest,
        observed: &crate::observed::ObservedInputs,
    ) -> StrongFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(weak.0.as_bytes());
        hasher.update(path_set_hash.as_bytes());
        for entry in observed.entries() {
            hasher.update(entry.path.to_string_lossy().as_bytes());
            hasher.update(&[entry.flags as u8]);
            if let Some(content) = &entry.content_hash {
                hasher.update(content.as_bytes());
            }
        }
        StrongFingerprint(Digest::from_hasher(hasher))
    }

    /// Hashes arbitrary bytes into a [`Digest`], used for content, path-set,
    /// and metadata blobs alike.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(bytes);
        Digest::from_hasher(hasher)
    }
}
