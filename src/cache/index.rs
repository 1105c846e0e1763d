//! Hash-Chain Index
//!
//! Maps the 32-bit secondary hash of a key to the chain of records whose
//! keys produced that hash. The hash only groups candidates: a lookup always
//! materializes each candidate's real key and compares it with the request,
//! because unrelated keys are expected to collide.
//!
//! Chains are plain vectors in append order, so unlinking a superseded
//! record is a vector removal.

use std::borrow::Borrow;
use std::collections::HashMap;

use tracing::warn;

use crate::error::Result;
use crate::format::RECORD_HEADER_LEN;

/// Computes the secondary hash of a serialized key package
pub type KeyHasher = fn(&[u8]) -> u32;

/// Default key hash: FxHash over the package bytes, folded to 32 bits
pub fn key_hash(package: &[u8]) -> u32 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in package {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    (hash ^ (hash >> 32)) as u32
}

/// Location of one live record in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset of the record header
    pub offset: u64,
    /// Size of the serialized key package
    pub key_len: u32,
    /// Size of the serialized object package
    pub object_len: u32,
}

impl IndexEntry {
    /// Offset of the key package
    #[inline]
    pub fn key_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_LEN
    }

    /// Offset of the object package
    #[inline]
    pub fn object_offset(&self) -> u64 {
        self.key_offset() + self.key_len as u64
    }

    /// Total bytes of the record, header included
    #[inline]
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + self.key_len as u64 + self.object_len as u64
    }
}

/// In-memory index of a set file
#[derive(Debug, Default)]
pub struct HashIndex {
    buckets: HashMap<u32, Vec<IndexEntry>>,
    len: usize,
}

impl HashIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Link an entry at the end of the chain for `hash`
    ///
    /// Returns `true` if the chain already held entries.
    pub fn insert(&mut self, hash: u32, entry: IndexEntry) -> bool {
        let chain = self.buckets.entry(hash).or_default();
        let collided = !chain.is_empty();
        chain.push(entry);
        self.len += 1;
        collided
    }

    /// Find the entry whose real key equals `key`
    ///
    /// `load_key` materializes a candidate's key. It returns `Ok(None)` when
    /// the candidate's record turns out to be dead on disk; such candidates
    /// are unlinked. Candidates whose key fails to load are skipped with a
    /// warning and the scan continues. With `remove` set, the match is
    /// unlinked from its chain.
    pub fn lookup<K, R, F>(
        &mut self,
        hash: u32,
        key: &K,
        remove: bool,
        mut load_key: F,
    ) -> Option<IndexEntry>
    where
        K: PartialEq + ?Sized,
        R: Borrow<K>,
        F: FnMut(&IndexEntry) -> Result<Option<R>>,
    {
        let chain = self.buckets.get_mut(&hash)?;

        let mut found = None;
        let mut i = 0;
        while i < chain.len() {
            let candidate = chain[i];
            match load_key(&candidate) {
                Ok(Some(real)) if real.borrow() == key => {
                    found = Some(i);
                    break;
                }
                Ok(Some(_)) => i += 1,
                Ok(None) => {
                    chain.remove(i);
                    self.len -= 1;
                }
                Err(e) => {
                    warn!(
                        offset = candidate.offset,
                        error = %e,
                        "Failed to load cached key, skipping candidate"
                    );
                    i += 1;
                }
            }
        }

        let result = found.map(|i| {
            if remove {
                self.len -= 1;
                chain.remove(i)
            } else {
                chain[i]
            }
        });

        if chain.is_empty() {
            self.buckets.remove(&hash);
        }
        result
    }

    /// Unlink the entry at `offset` from the chain for `hash`
    pub fn remove_offset(&mut self, hash: u32, offset: u64) -> Option<IndexEntry> {
        let chain = self.buckets.get_mut(&hash)?;
        let pos = chain.iter().position(|e| e.offset == offset)?;
        let entry = chain.remove(pos);
        self.len -= 1;
        if chain.is_empty() {
            self.buckets.remove(&hash);
        }
        Some(entry)
    }

    /// Entries chained under `hash`, in append order
    pub fn chain(&self, hash: u32) -> &[IndexEntry] {
        self.buckets.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every `(hash, entry)` pair, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &IndexEntry)> {
        self.buckets
            .iter()
            .flat_map(|(hash, chain)| chain.iter().map(move |e| (*hash, e)))
    }

    /// Number of indexed records
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================
