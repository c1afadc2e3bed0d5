//! The versioned in-memory record store. Data is not persisted; a node that
//! restarts comes back empty and relies on catch-up.
//!
//! Writes to a single key are serialized by a sharded lock table keyed by the
//! key's hash, so the leader can hold a key's lock across its replication
//! fan-out without serializing unrelated keys. Structural access to the map
//! itself takes a short global read/write lock.

use crate::api::{Record, Snapshot, Version};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

/// Number of write-lock shards. Keys hashing to the same shard contend; with
/// far more shards than in-flight writes this is rare.
const LOCK_SHARDS: usize = 64;

pub struct Store {
    records: RwLock<HashMap<String, Record>>,
    write_locks: Vec<tokio::sync::Mutex<()>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            write_locks: (0..LOCK_SHARDS).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    fn shard(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize % LOCK_SHARDS
    }

    /// Acquires the exclusive write lock for a key. The guard may be held
    /// across await points (e.g. the leader's sync fan-out); writes to other
    /// keys proceed in parallel.
    pub async fn lock_key(&self, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_locks[Self::shard(key)].lock().await
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.records.read().expect("store lock poisoned").get(key).cloned()
    }

    /// Stores a value at the next version for the key and returns it. The
    /// caller must hold the key's write lock, which makes the version
    /// sequence per key strictly increasing.
    pub fn put(&self, key: &str, value: String) -> Version {
        let mut records = self.records.write().expect("store lock poisoned");
        let version = records.get(key).map_or(0, |r| r.version) + 1;
        records.insert(key.into(), Record { value, version });
        version
    }

    /// Applies a replicated write if its version is strictly newer than the
    /// local one, otherwise drops it. Returns whether it was applied and the
    /// resulting local version. Idempotent.
    pub fn apply(&self, key: &str, value: String, version: Version) -> (bool, Version) {
        let mut records = self.records.write().expect("store lock poisoned");
        let local = records.get(key).map_or(0, |r| r.version);
        if version > local {
            records.insert(key.into(), Record { value, version });
            (true, version)
        } else {
            (false, local)
        }
    }

    /// Loads a snapshot, applying each record under the same monotonic rule
    /// as replication so that records the node already has at a newer
    /// version are never regressed. Returns the number of records applied.
    pub fn bulk_load(&self, snapshot: Snapshot) -> usize {
        let mut records = self.records.write().expect("store lock poisoned");
        let mut loaded = 0;
        for (key, record) in snapshot.records {
            let local = records.get(&key).map_or(0, |r| r.version);
            if record.version > local {
                records.insert(key, record);
                loaded += 1;
            }
        }
        loaded
    }

    /// Returns a consistent full copy of the store.
    pub fn snapshot(&self) -> Snapshot {
        let records = self.records.read().expect("store lock poisoned");
        Snapshot { records: records.iter().map(|(k, v)| (k.clone(), v.clone())).collect() }
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
