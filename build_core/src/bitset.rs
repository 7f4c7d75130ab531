// Copyright 2026 the Execution Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Ranged bitmap of node ids, with a fixed-layout serialization format and a
//! lock-free concurrent variant for parallel graph traversal.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ids::NodeId;

const BITS_PER_WORD: usize = 64;

#[inline]
fn word_and_bit(node: NodeId) -> (usize, u64) {
    let idx = node.index();
    (idx / BITS_PER_WORD, 1u64 << (idx % BITS_PER_WORD))
}

#[inline]
fn words_for(capacity: usize) -> usize {
    capacity.div_ceil(BITS_PER_WORD)
}

/// A ranged bitmap over node ids `0..capacity`.
///
/// This is the persisted representation for the dirty tracker's three sets,
/// each written as a length-prefixed bitmap over a contiguous node-id range,
/// and the scratch representation for the build-set calculator's
/// visited/scheduled sets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSet {
    words: Vec<u64>,
    capacity: usize,
}

impl NodeSet {
    /// Creates an empty set over node ids `0..capacity`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0u64; words_for(capacity)],
            capacity,
        }
    }

    /// Returns the node-id range this set covers.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts `node`. Returns `true` if it was not already present.
    ///
    /// No-op (returns `false`) if `node` is outside this set's capacity.
    pub fn insert(&mut self, node: NodeId) -> bool {
        if node.index() >= self.capacity {
            return false;
        }
        let (w, bit) = word_and_bit(node);
        let was_set = self.words[w] & bit != 0;
        self.words[w] |= bit;
        !was_set
    }

    /// Removes `node`. Returns `true` if it was present.
    pub fn remove(&mut self, node: NodeId) -> bool {
        if node.index() >= self.capacity {
            return false;
        }
        let (w, bit) = word_and_bit(node);
        let was_set = self.words[w] & bit != 0;
        self.words[w] &= !bit;
        was_set
    }

    /// Returns `true` if `node` is a member of this set.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        if node.index() >= self.capacity {
            return false;
        }
        let (w, bit) = word_and_bit(node);
        self.words[w] & bit != 0
    }

    /// Returns `true` if this set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Returns the number of members (population count).
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Removes all members, preserving capacity.
    pub fn clear(&mut self) {
        for w in &mut self.words {
            *w = 0;
        }
    }

    /// Iterates over member node ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            (0..BITS_PER_WORD).filter_map(move |bi| {
                if word & (1u64 << bi) != 0 {
                    Some(NodeId::new((wi * BITS_PER_WORD + bi) as u32))
                } else {
                    None
                }
            })
        })
    }

    /// Unions `other` into `self` in place. `other` must have the same
    /// capacity.
    pub fn union_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
    }

    /// Intersects `self` with `other` in place. `other` must have the same
    /// capacity.
    pub fn intersect_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= *b;
        }
    }

    /// Removes every member of `other` from `self` in place
    /// (set difference).
    pub fn subtract(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    /// Serializes this set in the fixed external layout: a little-endian
    /// `u32` capacity, a little-endian `u32` word count, then each word as
    /// little-endian `u64`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.capacity as u32).to_le_bytes());
        out.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }

    /// Deserializes a set previously written by [`NodeSet::serialize`],
    /// advancing `offset` past the bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`BitsetDecodeError`] if the byte stream is truncated or the
    /// word count is inconsistent with the declared capacity.
    pub fn deserialize(bytes: &[u8], offset: &mut usize) -> Result<Self, BitsetDecodeError> {
        let capacity = read_u32(bytes, offset)? as usize;
        let word_count = read_u32(bytes, offset)? as usize;
        if word_count != words_for(capacity) {
            return Err(BitsetDecodeError::InconsistentLength);
        }
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(read_u64(bytes, offset)?);
        }
        Ok(Self { words, capacity })
    }
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, BitsetDecodeError> {
    let end = offset
        .checked_add(4)
        .ok_or(BitsetDecodeError::UnexpectedEof)?;
    let slice = bytes.get(*offset..end).ok_or(BitsetDecodeError::UnexpectedEof)?;
    *offset = end;
    Ok(u32::from_le_bytes(slice.try_into().expect("slice is 4 bytes")))
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64, BitsetDecodeError> {
    let end = offset
        .checked_add(8)
        .ok_or(BitsetDecodeError::UnexpectedEof)?;
    let slice = bytes.get(*offset..end).ok_or(BitsetDecodeError::UnexpectedEof)?;
    *offset = end;
    Ok(u64::from_le_bytes(slice.try_into().expect("slice is 8 bytes")))
}

/// Error produced while decoding a [`NodeSet`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BitsetDecodeError {
    /// The byte stream ended before the declared content was fully read.
    #[error("unexpected end of bitset byte stream")]
    UnexpectedEof,
    /// The declared word count did not match the declared capacity.
    #[error("bitset word count is inconsistent with its declared capacity")]
    InconsistentLength,
}

/// A lock-free concurrent node set supporting atomic test-and-set, used by
/// the build-set calculator's fork-join cone traversal to give every node a
/// single deterministic winner among racing visitors.
#[derive(Debug)]
pub struct ConcurrentNodeSet {
    words: Vec<AtomicU64>,
    capacity: usize,
}

impl ConcurrentNodeSet {
    /// Creates an empty concurrent set over node ids `0..capacity`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut words = Vec::with_capacity(words_for(capacity));
        words.resize_with(words_for(capacity), || AtomicU64::new(0));
        Self { words, capacity }
    }

    /// Atomically marks `node` visited. Returns `true` if this call is the
    /// one that transitioned it from unvisited to visited ("visited-first-
    /// wins" semantics, spec §5).
    pub fn try_insert(&self, node: NodeId) -> bool {
        if node.index() >= self.capacity {
            return false;
        }
        let (w, bit) = word_and_bit(node);
        let prev = self.words[w].fetch_or(bit, Ordering::AcqRel);
        prev & bit == 0
    }

    /// Returns `true` if `node` has been marked visited.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        if node.index() >= self.capacity {
            return false;
        }
        let (w, bit) = word_and_bit(node);
        self.words[w].load(Ordering::Acquire) & bit != 0
    }

    /// Snapshots this concurrent set into an ordinary [`NodeSet`].
    ///
    /// Intended to be called only after all writer threads have joined.
    #[must_use]
    pub fn into_node_set(self) -> NodeSet {
        let words = self
            .words
            .into_iter()
            .map(|w| w.into_inner())
            .collect::<Vec<_>>();
        NodeSet {
            words,
            capacity: self.capacity,
        }
    }
}
