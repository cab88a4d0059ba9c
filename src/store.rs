// Storage module - HOT PATH
// Sharded map: N fixed shards, each an ahash-keyed HashMap behind a
// reader-writer lock. Shard selection must be stable across runs (the WAL
// replays into a freshly built map), so it uses FNV-1a rather than the
// per-process-seeded hasher used inside the shards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use ahash::RandomState;
use bytes::Bytes;

// ==================== Hash Function ====================

pub const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// FNV-1a 64-bit digest. Deterministic across runs and platforms.
#[inline(always)]
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ==================== Sharded Map ====================

/// Outcome of [`ShardedMap::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new; the item count grew by one.
    Inserted,
    /// The key existed and its value was overwritten in place.
    Updated,
}

struct Shard {
    entries: RwLock<HashMap<Bytes, Bytes, RandomState>>,
}

/// Fixed-shard concurrent map. Operations on different shards are fully
/// independent; writers within a shard are serialized; readers within a
/// shard are concurrent. There is no global lock on the hot path.
pub struct ShardedMap {
    shards: Vec<Shard>,
    item_count: AtomicUsize,
}

/// Point-in-time occupancy summary, as reported by the STATS verb.
#[derive(Debug, Clone)]
pub struct MapStatistics {
    pub item_count: usize,
    pub shard_count: usize,
    pub shard_sizes: Vec<usize>,
    pub load_factor: f64,
    pub utilization: f64,
}

impl ShardedMap {
    /// Allocate `num_shards` shards, each pre-sized for `initial_capacity`
    /// entries. The shard count is fixed for the lifetime of the map.
    pub fn new(num_shards: usize, initial_capacity: usize) -> Self {
        assert!(num_shards > 0, "shard count must be non-zero");
        let shards = (0..num_shards)
            .map(|_| Shard {
                entries: RwLock::new(HashMap::with_capacity_and_hasher(
                    initial_capacity,
                    RandomState::new(),
                )),
            })
            .collect();
        Self {
            shards,
            item_count: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    fn shard(&self, key: &[u8]) -> &Shard {
        let index = (fnv1a(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Insert or overwrite. The item counter moves only for genuinely new
    /// keys.
    #[inline(always)]
    pub fn insert(&self, key: Bytes, value: Bytes) -> InsertOutcome {
        let mut entries = self.shard(&key).entries.write().unwrap();
        match entries.insert(key, value) {
            Some(_) => InsertOutcome::Updated,
            None => {
                self.item_count.fetch_add(1, Ordering::Relaxed);
                InsertOutcome::Inserted
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    #[inline(always)]
    pub fn erase(&self, key: &[u8]) -> bool {
        let mut entries = self.shard(key).entries.write().unwrap();
        if entries.remove(key).is_some() {
            self.item_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Look up a key, returning a clone of the value. The clone is a
    /// refcount bump; no borrow escapes the shard lock.
    #[inline(always)]
    pub fn find(&self, key: &[u8]) -> Option<Bytes> {
        let entries = self.shard(key).entries.read().unwrap();
        entries.get(key).cloned()
    }

    #[inline(always)]
    pub fn exists(&self, key: &[u8]) -> bool {
        let entries = self.shard(key).entries.read().unwrap();
        entries.contains_key(key)
    }

    /// Approximate under concurrent mutation, exact at quiescence.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Empty every shard, taking the write locks in shard-index order, then
    /// reset the item counter.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut entries = shard.entries.write().unwrap();
            entries.clear();
        }
        self.item_count.store(0, Ordering::Relaxed);
    }

    /// Visit every entry. Each shard is read-locked in turn: the visitor
    /// sees a consistent view per shard, not a globally atomic snapshot.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Bytes, &Bytes),
    {
        for shard in &self.shards {
            let entries = shard.entries.read().unwrap();
            for (key, value) in entries.iter() {
                visitor(key, value);
            }
        }
    }

    pub fn statistics(&self) -> MapStatistics {
        let mut shard_sizes = Vec::with_capacity(self.shards.len());
        let mut nonempty = 0usize;
        for shard in &self.shards {
            let size = shard.entries.read().unwrap().len();
            if size > 0 {
                nonempty += 1;
            }
            shard_sizes.push(size);
        }

        let item_count = self.len();
        let shard_count = self.shards.len();
        MapStatistics {
            item_count,
            shard_count,
            shard_sizes,
            load_factor: item_count as f64 / shard_count as f64,
            utilization: nonempty as f64 / shard_count as f64,
        }
    }
}
