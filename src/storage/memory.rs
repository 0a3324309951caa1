//! Sharded In-Memory Store
//!
//! The default [`Store`] implementation.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: 64 shards, each behind its own `RwLock`, so reads of
//!    unrelated keys never contend.
//! 2. **Lazy Expiry**: Keys with a TTL are checked on access and removed once
//!    expired.
//! 3. **Key Limit**: An optional cap on the number of keys. Writes that would
//!    create a key past the cap fail with [`StoreError::OutOfMemory`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MemoryStore                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::storage::{Store, StoreError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Number of shards.
const NUM_SHARDS: usize = 64;

/// A stored value with optional expiry time.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Bytes, expire: Option<Duration>) -> Result<Self, StoreError> {
        let expires_at = match expire {
            Some(ttl) => Some(
                Instant::now()
                    .checked_add(ttl)
                    .ok_or(StoreError::InvalidExpire)?,
            ),
            None => None,
        };
        Ok(Self { value, expires_at })
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

type ShardMap = HashMap<Bytes, Entry>;

/// Operation counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub expired: AtomicU64,
    pub rejected: AtomicU64,
}

/// A thread-safe, sharded key-value store.
///
/// # Example
///
/// ```
/// use jollykv::storage::{MemoryStore, Store};
/// use bytes::Bytes;
///
/// let store = MemoryStore::new();
/// store.set(Bytes::from("name"), Bytes::from("Ariz"), None).unwrap();
/// assert_eq!(store.get(b"name"), Some(Bytes::from("Ariz")));
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<RwLock<ShardMap>>,

    /// Maximum number of keys (0 = unlimited)
    max_keys: usize,

    stats: StoreStats,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::with_max_keys(0)
    }

    /// Creates a store holding at most `max_keys` keys (0 = unlimited).
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            max_keys,
            stats: StoreStats::default(),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    #[inline]
    fn shard_index(key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    // A poisoned shard only means another thread panicked mid-operation;
    // the map itself is still structurally valid.
    fn read_shard(&self, key: &[u8]) -> RwLockReadGuard<'_, ShardMap> {
        self.shards[Self::shard_index(key)]
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_shard(&self, key: &[u8]) -> RwLockWriteGuard<'_, ShardMap> {
        self.shards[Self::shard_index(key)]
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Fails if inserting `new_keys` brand-new keys would exceed `max_keys`.
    ///
    /// Expired keys still occupy a slot until reclaimed, so a hit sweeps
    /// them before rejecting.
    fn check_capacity(&self, new_keys: usize) -> Result<(), StoreError> {
        if self.max_keys == 0 || new_keys == 0 {
            return Ok(());
        }

        let fits = |len: usize| len.saturating_add(new_keys) <= self.max_keys;
        if fits(self.len()) {
            return Ok(());
        }
        if self.cleanup_expired() > 0 && fits(self.len()) {
            return Ok(());
        }

        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Err(StoreError::OutOfMemory {
            max_keys: self.max_keys,
        })
    }

    /// Looks up a live entry under a write lock, dropping it if expired.
    fn live_entry<'a>(&self, shard: &'a mut ShardMap, key: &[u8]) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if shard.get(key).is_some_and(|e| e.is_expired(now)) {
            shard.remove(key);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        shard.get_mut(key)
    }

    /// Removes every expired key. Returns how many were removed.
    pub fn cleanup_expired(&self) -> u64 {
        let now = Instant::now();
        let mut removed = 0u64;

        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired(now));
            removed += (before - shard.len()) as u64;
        }

        self.stats.expired.fetch_add(removed, Ordering::Relaxed);
        removed
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);

        {
            let shard = self.read_shard(key);
            match shard.get(key) {
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and remove it.
        let mut shard = self.write_shard(key);
        self.live_entry(&mut shard, key).map(|e| e.value.clone())
    }

    fn set(&self, key: Bytes, value: Bytes, expire: Option<Duration>) -> Result<(), StoreError> {
        let entry = Entry::new(value, expire)?;
        if !self.exists(&key) {
            self.check_capacity(1)?;
        }

        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.write_shard(&key);
        shard.insert(key, entry);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.write_shard(key);
        match shard.remove(key) {
            Some(entry) => !entry.is_expired(Instant::now()),
            None => false,
        }
    }

    fn exists(&self, key: &[u8]) -> bool {
        let shard = self.read_shard(key);
        shard
            .get(key)
            .is_some_and(|e| !e.is_expired(Instant::now()))
    }

    fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        let mut shard = self.write_shard(key);

        let current = match self.live_entry(&mut shard, key) {
            Some(entry) => Some(
                std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(StoreError::NotAnInteger)?,
            ),
            None => None,
        };

        let next = current
            .unwrap_or(0)
            .checked_add(delta)
            .ok_or(StoreError::Overflow)?;
        let value = Bytes::from(next.to_string());

        self.stats.sets.fetch_add(1, Ordering::Relaxed);

        // An existing TTL is kept
        if let Some(entry) = self.live_entry(&mut shard, key) {
            entry.value = value;
            return Ok(next);
        }

        drop(shard);
        self.check_capacity(1)?;
        self.write_shard(key)
            .insert(Bytes::copy_from_slice(key), Entry::new(value, None)?);
        Ok(next)
    }

    fn append(&self, key: &[u8], value: &[u8]) -> Result<usize, StoreError> {
        let mut shard = self.write_shard(key);

        if let Some(entry) = self.live_entry(&mut shard, key) {
            let mut joined = BytesMut::with_capacity(entry.value.len() + value.len());
            joined.extend_from_slice(&entry.value);
            joined.extend_from_slice(value);
            entry.value = joined.freeze();
            return Ok(entry.value.len());
        }

        drop(shard);
        self.check_capacity(1)?;
        self.write_shard(key).insert(
            Bytes::copy_from_slice(key),
            Entry::new(Bytes::copy_from_slice(value), None)?,
        );
        Ok(value.len())
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    fn flush(&self) {
        for shard in &self.shards {
            shard.write().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    fn ensure_capacity(&self, new_keys: usize) -> Result<(), StoreError> {
        self.check_capacity(new_keys)
    }
}
