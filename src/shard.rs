//! Fixed-fanout striped locks keyed by entity id.
//!
//! Per-entity critical sections (index merges) hash the id onto one of a
//! fixed set of mutexes so non-conflicting writes proceed in parallel. When
//! one logical operation touches several entities (a parent and its chunks)
//! the shards are acquired in ascending id order to prevent deadlocks.

use std::sync::{Mutex, MutexGuard};

use xxhash_rust::xxh3::xxh3_64;

pub const SHARD_COUNT: usize = 64;

pub struct ShardedLock {
    shards: Vec<Mutex<()>>,
}

impl Default for ShardedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedLock {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_of(&self, id: &str) -> usize {
        (xxh3_64(id.as_bytes()) % SHARD_COUNT as u64) as usize
    }

    pub fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_of(id)]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Locks every shard covering `ids`, ascending by id so concurrent
    /// multi-entity operations cannot deadlock. Duplicate shards are taken
    /// once.
    pub fn lock_many<'a, 'b>(&'a self, ids: &mut [&'b str]) -> Vec<MutexGuard<'a, ()>> {
        ids.sort_unstable();

        let mut taken: Vec<usize> = Vec::with_capacity(ids.len());
        let mut guards = Vec::with_capacity(ids.len());

        for id in ids.iter() {
            let shard = self.shard_of(id);
            if taken.contains(&shard) {
                continue;
            }
            taken.push(shard);
            guards.push(
                self.shards[shard]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()),
            );
        }

        guards
    }
}
