//! Rank-local index storage

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::format::ReadId;
use crate::kmer::Kmer;

/// Metadata stored per k-mer occurrence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryValue {
    pub read_id: ReadId,
    /// Character offset of the window start within the read.
    pub offset: u32,
    /// Combined log2 correctness probability of the window.
    pub quality: f64,
}

/// In-memory multimap holding one rank's partition of the index
///
/// Writers (worker threads inserting locally-owned keys, the receiver thread
/// dispatching inbound entries) take the write lock; queries take the read
/// lock. Entries with the same key accumulate; nothing is deduplicated.
pub struct LocalShard {
    map: RwLock<HashMap<Kmer, Vec<EntryValue>, ahash::RandomState>>,
    entries: AtomicU64,
}

impl LocalShard {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::with_hasher(ahash::RandomState::new())),
            entries: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, kmer: Kmer, value: EntryValue) {
        self.map.write().entry(kmer).or_default().push(value);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// All entries recorded for `kmer`, copied out of the shard.
    pub fn get(&self, kmer: &Kmer) -> Vec<EntryValue> {
        self.map.read().get(kmer).cloned().unwrap_or_default()
    }

    /// Number of entries (not distinct keys).
    pub fn n_entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn n_keys(&self) -> usize {
        self.map.read().len()
    }

    /// Snapshot of the stored keys.
    pub fn keys(&self) -> Vec<Kmer> {
        self.map.read().keys().copied().collect()
    }
}

impl Default for LocalShard {
    fn default() -> Self {
        Self::new()
    }
}
