// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Generic two-level cache
//!
//! L1 is an in-process LRU split into independently locked shards. L2 is an
//! optional shared [`BackingStore`] reached through a circuit breaker.
//!
//! Ordering between stores and invalidations is decided by one monotonic
//! version counter per cache, never by arrival time:
//! - every stored entry gets a fresh version
//! - every invalidation takes a fresh version and leaves a tombstone
//!   `(pattern, version)` behind
//! - a store carries the [`StoreTicket`] its caller observed before
//!   executing; if a matching tombstone is newer than the ticket the store
//!   is dropped
//! - entries read back from L2 are checked against the tombstones too
//!
//! Tombstones are kept for a retention period. Tickets older than the oldest
//! retained tombstone (the floor) are rejected outright.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backing::BackingStore;
use super::breaker::{BreakerState, CircuitBreaker};
use super::codec::{self, StoredEntry};
use super::lru::LruMap;
use super::{
    CacheCounters, CacheEntry, CacheHit, CacheKey, CacheLevel, CacheStats, CacheValue, KeyPattern,
    RemovedEntry,
};
use crate::clock::Clock;
use crate::config::{BreakerConfig, InvalidationConfig};

/// Cache version observed before executing a query
///
/// Passed back with the store so an invalidation that happened in between
/// wins over the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreTicket(pub u64);

/// Result of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { version: u64 },
    /// A newer invalidation covers the key; nothing was written
    Superseded,
    /// Zero TTL; nothing was written
    Skipped,
}

impl PutOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored { .. })
    }
}

/// Result of an invalidation
#[derive(Debug, Clone)]
pub struct InvalidationOutcome {
    pub version: u64,
    /// Entries removed from L1
    pub removed: Vec<RemovedEntry>,
    /// Keys removed from L2
    pub backing_removed: Vec<String>,
    /// Set when L2 could not be purged; tombstones still cover it
    pub backing_error: Option<String>,
}

impl InvalidationOutcome {
    /// Distinct keys removed from either level
    pub fn affected_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .removed
            .iter()
            .map(|entry| entry.key.clone())
            .chain(self.backing_removed.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[derive(Debug, Clone)]
struct Tombstone {
    pattern: KeyPattern,
    version: u64,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct TombstoneLog {
    entries: VecDeque<Tombstone>,
    /// Version of the newest tombstone pruned so far
    floor: u64,
}

impl TombstoneLog {
    /// A newer tombstone matches the key
    fn covers(&self, key: &str, tags: &[String], version: u64) -> bool {
        self.entries
            .iter()
            .rev()
            .take_while(|t| t.version > version)
            .any(|t| t.pattern.matches(key, tags))
    }

    fn pop_front(&mut self) -> bool {
        match self.entries.pop_front() {
            Some(tombstone) => {
                self.floor = self.floor.max(tombstone.version);
                true
            }
            None => false,
        }
    }
}

struct Shard<K, V> {
    entries: LruMap<K, CacheEntry<K, V>>,
    by_key: BTreeMap<String, K>,
    by_tag: HashMap<String, HashSet<K>>,
    memory_bytes: usize,
}

impl<K: CacheKey, V: CacheValue> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruMap::new(capacity),
            by_key: BTreeMap::new(),
            by_tag: HashMap::new(),
            memory_bytes: 0,
        }
    }

    /// Insert or replace; returns the entry evicted for room
    fn insert(&mut self, entry: CacheEntry<K, V>) -> Option<CacheEntry<K, V>> {
        if let Some(old) = self.entries.remove(&entry.key) {
            self.unindex(&old);
        }
        self.index(&entry);
        let evicted = self
            .entries
            .insert(entry.key.clone(), entry)
            .map(|(_, evicted)| evicted);
        if let Some(evicted) = &evicted {
            self.unindex(evicted);
        }
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let entry = self.entries.remove(key)?;
        self.unindex(&entry);
        Some(entry)
    }

    fn remove_matching(&mut self, pattern: &KeyPattern) -> Vec<CacheEntry<K, V>> {
        let keys: Vec<K> = match pattern {
            KeyPattern::Exact(rendered) => self.by_key.get(rendered).cloned().into_iter().collect(),
            KeyPattern::Prefix(prefix) => self
                .by_key
                .range(prefix.clone()..)
                .take_while(|(rendered, _)| rendered.starts_with(prefix.as_str()))
                .map(|(_, key)| key.clone())
                .collect(),
            KeyPattern::Tag(tag) => self
                .by_tag
                .get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        };
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired = self.entries.drain_where(|_, entry| entry.is_expired_at(now));
        for (_, entry) in &expired {
            self.unindex(entry);
        }
        expired.len()
    }

    fn index(&mut self, entry: &CacheEntry<K, V>) {
        self.by_key
            .insert(entry.rendered_key.clone(), entry.key.clone());
        for tag in &entry.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.memory_bytes += entry.size_bytes;
    }

    fn unindex(&mut self, entry: &CacheEntry<K, V>) {
        self.by_key.remove(&entry.rendered_key);
        for tag in &entry.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);
    }
}

/// Two-level cache parameterized by key and value type
pub struct MultiLevelCache<K: CacheKey, V: CacheValue> {
    name: String,
    shards: Vec<Mutex<Shard<K, V>>>,
    backing: Option<Arc<dyn BackingStore>>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    version: AtomicU64,
    tombstones: RwLock<TombstoneLog>,
    tombstone_retention: Duration,
    max_tombstones: usize,
    counters: CacheCounters,
}

impl<K: CacheKey, V: CacheValue> MultiLevelCache<K, V> {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        shard_count: usize,
        backing: Option<Arc<dyn BackingStore>>,
        invalidation: &InvalidationConfig,
        breaker: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let shard_count = shard_count.max(1);
        let per_shard = (capacity / shard_count).max(1);
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker, clock.clone()),
            name,
            shards: (0..shard_count)
                .map(|_| Mutex::new(Shard::new(per_shard)))
                .collect(),
            backing,
            clock,
            version: AtomicU64::new(0),
            tombstones: RwLock::new(TombstoneLog::default()),
            tombstone_retention: invalidation.tombstone_retention,
            max_tombstones: invalidation.max_tombstones.max(1),
            counters: CacheCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Current version; hand it back to [`MultiLevelCache::put_with`]
    pub fn ticket(&self) -> StoreTicket {
        StoreTicket(self.version.load(Ordering::SeqCst))
    }

    fn shard_for(&self, rendered_key: &str) -> &Mutex<Shard<K, V>> {
        let mut hasher = DefaultHasher::new();
        rendered_key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn ticket_superseded(&self, rendered_key: &str, tags: &[String], ticket: StoreTicket) -> bool {
        let log = self.tombstones.read();
        ticket.0 < log.floor || log.covers(rendered_key, tags, ticket.0)
    }

    fn entry_superseded(&self, rendered_key: &str, tags: &[String], version: u64) -> bool {
        self.tombstones.read().covers(rendered_key, tags, version)
    }

    fn all_tags(key: &K, extra_tags: &[String]) -> Vec<String> {
        let mut tags = key.tags();
        for tag in extra_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    /// Value for `key` if present and unexpired in either level
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).map(|hit| hit.value)
    }

    /// Like [`MultiLevelCache::get`] but reports where the value came from
    pub fn lookup(&self, key: &K) -> Option<CacheHit<V>> {
        let rendered = key.cache_key();
        let now = self.clock.now();

        {
            let mut shard = self.shard_for(&rendered).lock();
            let mut expired = false;
            if let Some(entry) = shard.entries.get_mut(key) {
                if entry.is_expired_at(now) {
                    expired = true;
                } else {
                    entry.update_access(now);
                    CacheCounters::bump(&self.counters.l1_hits);
                    log::debug!("{} L1 hit: {}", self.name, rendered);
                    return Some(CacheHit {
                        value: entry.value.clone(),
                        level: CacheLevel::L1,
                        version: entry.version,
                        stored_at: entry.stored_at,
                        ttl: entry.ttl,
                    });
                }
            }
            if expired {
                shard.remove(key);
                CacheCounters::bump(&self.counters.expirations);
            }
        }

        match self.lookup_backing(key, &rendered, now) {
            Some(hit) => {
                CacheCounters::bump(&self.counters.l2_hits);
                log::debug!("{} L2 hit: {}", self.name, rendered);
                Some(hit)
            }
            None => {
                CacheCounters::bump(&self.counters.misses);
                log::debug!("{} miss: {}", self.name, rendered);
                None
            }
        }
    }

    fn lookup_backing(&self, key: &K, rendered: &str, now: Instant) -> Option<CacheHit<V>> {
        let backing = self.backing.as_ref()?;
        if !self.breaker.allow_request() {
            return None;
        }

        let bytes = match backing.get(rendered) {
            Ok(Some(bytes)) => {
                self.breaker.record_success();
                bytes
            }
            Ok(None) => {
                self.breaker.record_success();
                return None;
            }
            Err(e) => {
                self.breaker.record_failure();
                CacheCounters::bump(&self.counters.backing_errors);
                log::warn!(
                    "{} backing read failed for {}, treating as miss: {}",
                    self.name,
                    rendered,
                    e
                );
                return None;
            }
        };

        let stored: StoredEntry<V> = match codec::decode(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("{} dropping corrupt backing entry {}: {}", self.name, rendered, e);
                if let Err(e) = backing.remove(rendered) {
                    log::warn!("{} could not remove corrupt entry {}: {}", self.name, rendered, e);
                }
                return None;
            }
        };

        let now_ms = self.clock.wall_millis();
        if stored.is_expired(now_ms) {
            return None;
        }
        if self.entry_superseded(rendered, &stored.tags, stored.version) {
            log::debug!("{} backing entry {} predates an invalidation", self.name, rendered);
            if let Err(e) = backing.remove(rendered) {
                log::warn!("{} could not remove stale entry {}: {}", self.name, rendered, e);
            }
            return None;
        }

        // Keep local versions ahead of anything observed in the shared layer
        self.version.fetch_max(stored.version, Ordering::SeqCst);

        let age = Duration::from_millis(now_ms.saturating_sub(stored.stored_at_ms));
        let stored_at = now.checked_sub(age).unwrap_or(now);
        let ttl = Duration::from_millis(stored.ttl_ms);

        let mut shard = self.shard_for(rendered).lock();
        // Recheck under the shard lock: an invalidation may have swept this shard meanwhile
        if self.entry_superseded(rendered, &stored.tags, stored.version) {
            return None;
        }
        if let Some(existing) = shard.entries.peek(key) {
            if existing.version >= stored.version && !existing.is_expired_at(now) {
                return Some(CacheHit {
                    value: existing.value.clone(),
                    level: CacheLevel::L1,
                    version: existing.version,
                    stored_at: existing.stored_at,
                    ttl: existing.ttl,
                });
            }
        }

        let size_bytes = stored.value.size_bytes() + rendered.len();
        let entry = CacheEntry {
            key: key.clone(),
            rendered_key: rendered.to_string(),
            value: stored.value.clone(),
            stored_at,
            ttl,
            last_accessed_at: now,
            access_count: 1,
            version: stored.version,
            tags: stored.tags,
            size_bytes,
        };
        if shard.insert(entry).is_some() {
            CacheCounters::bump(&self.counters.evictions);
        }

        Some(CacheHit {
            value: stored.value,
            level: CacheLevel::L2,
            version: stored.version,
            stored_at,
            ttl,
        })
    }

    /// Store with a fresh ticket and the key's own tags
    pub fn put(&self, key: K, value: V, ttl: Duration) -> PutOutcome {
        self.put_with(key, value, ttl, self.ticket(), &[])
    }

    /// Store unless an invalidation newer than `ticket` covers the key
    pub fn put_with(
        &self,
        key: K,
        value: V,
        ttl: Duration,
        ticket: StoreTicket,
        extra_tags: &[String],
    ) -> PutOutcome {
        if ttl.is_zero() {
            return PutOutcome::Skipped;
        }

        let rendered = key.cache_key();
        let tags = Self::all_tags(&key, extra_tags);
        let now = self.clock.now();
        let size_bytes = value.size_bytes() + rendered.len();

        let version = {
            let mut shard = self.shard_for(&rendered).lock();
            // Taken before the check: an invalidation missed by the check is always newer
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            if self.ticket_superseded(&rendered, &tags, ticket) {
                CacheCounters::bump(&self.counters.superseded_puts);
                log::debug!(
                    "{} dropping store for {}: invalidated after ticket {}",
                    self.name,
                    rendered,
                    ticket.0
                );
                return PutOutcome::Superseded;
            }

            let entry = CacheEntry {
                key,
                rendered_key: rendered.clone(),
                value: value.clone(),
                stored_at: now,
                ttl,
                last_accessed_at: now,
                access_count: 0,
                version,
                tags: tags.clone(),
                size_bytes,
            };
            if shard.insert(entry).is_some() {
                CacheCounters::bump(&self.counters.evictions);
            }
            version
        };
        CacheCounters::bump(&self.counters.insertions);

        self.write_backing(&rendered, value, ttl, version, tags);
        PutOutcome::Stored { version }
    }

    fn write_backing(&self, rendered: &str, value: V, ttl: Duration, version: u64, tags: Vec<String>) {
        let backing = match &self.backing {
            Some(backing) => backing,
            None => return,
        };
        if !self.breaker.allow_request() {
            log::debug!("{} breaker open, {} kept in L1 only", self.name, rendered);
            return;
        }

        let stored = StoredEntry {
            value,
            version,
            stored_at_ms: self.clock.wall_millis(),
            ttl_ms: ttl.as_millis() as u64,
            tags,
        };
        let bytes = match codec::encode(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("{} could not encode {}: {}", self.name, rendered, e);
                return;
            }
        };

        match backing.put(rendered, bytes, ttl, &stored.tags) {
            Ok(()) => {
                self.breaker.record_success();
                // An invalidation may have purged L2 before this write landed
                if self.entry_superseded(rendered, &stored.tags, version) {
                    if let Err(e) = backing.remove(rendered) {
                        log::warn!("{} could not retract {}: {}", self.name, rendered, e);
                    }
                }
            }
            Err(e) => {
                self.breaker.record_failure();
                CacheCounters::bump(&self.counters.backing_errors);
                log::warn!("{} backing write failed for {}: {}", self.name, rendered, e);
            }
        }
    }

    /// Remove every key matching `pattern` from both levels
    ///
    /// Stores holding a ticket older than this invalidation are dropped
    /// afterwards. Other keys are never blocked: shards are swept one at a
    /// time.
    pub fn invalidate(&self, pattern: &KeyPattern) -> InvalidationOutcome {
        let now = self.clock.now();
        let version = {
            let mut log = self.tombstones.write();
            // Assigned under the write lock so the log stays ordered by version
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            log.entries.push_back(Tombstone {
                pattern: pattern.clone(),
                version,
                created_at: now,
            });
            while log.entries.len() > self.max_tombstones {
                log.pop_front();
            }
            version
        };

        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            removed.extend(shard.remove_matching(pattern).into_iter().map(|entry| {
                RemovedEntry {
                    key: entry.rendered_key,
                    stored_at: entry.stored_at,
                    ttl: entry.ttl,
                    version: entry.version,
                }
            }));
        }
        CacheCounters::add(&self.counters.invalidated, removed.len() as u64);

        let mut backing_removed = Vec::new();
        let mut backing_error = None;
        if let Some(backing) = &self.backing {
            if self.breaker.allow_request() {
                match backing.remove_matching(pattern) {
                    Ok(keys) => {
                        self.breaker.record_success();
                        backing_removed = keys;
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        CacheCounters::bump(&self.counters.backing_errors);
                        log::warn!(
                            "{} could not purge '{}' from backing store: {}",
                            self.name,
                            pattern,
                            e
                        );
                        backing_error = Some(e.to_string());
                    }
                }
            } else {
                backing_error = Some("circuit breaker open".to_string());
            }
        }

        log::debug!(
            "{} invalidated '{}' at version {}: {} local, {} shared",
            self.name,
            pattern,
            version,
            removed.len(),
            backing_removed.len()
        );

        InvalidationOutcome {
            version,
            removed,
            backing_removed,
            backing_error,
        }
    }

    /// Bulk-load known entries; returns how many were stored
    pub fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, V, Duration)>,
    {
        let mut stored = 0;
        for (key, value, ttl) in entries {
            match self.put(key.clone(), value, ttl) {
                PutOutcome::Stored { .. } => stored += 1,
                outcome => log::debug!("{} skipped warming {:?}: {:?}", self.name, key, outcome),
            }
        }
        log::info!("{} warmed with {} entries", self.name, stored);
        stored
    }

    /// Drop expired L1 entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let purged: usize = self
            .shards
            .iter()
            .map(|shard| shard.lock().remove_expired(now))
            .sum();
        CacheCounters::add(&self.counters.expirations, purged as u64);
        purged
    }

    /// Drop tombstones past retention; returns how many were dropped
    pub fn prune_tombstones(&self) -> usize {
        let now = self.clock.now();
        let mut log = self.tombstones.write();
        let mut pruned = 0;
        while log
            .entries
            .front()
            .map_or(false, |t| now.saturating_duration_since(t.created_at) >= self.tombstone_retention)
        {
            log.pop_front();
            pruned += 1;
        }
        pruned
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.read().entries.len()
    }

    /// Entries in L1
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, memory) = self.shards.iter().fold((0, 0), |(entries, memory), shard| {
            let shard = shard.lock();
            (entries + shard.entries.len(), memory + shard.memory_bytes)
        });
        self.counters.snapshot(entries, memory)
    }
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for MultiLevelCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("backing", &self.backing.as_ref().map(|b| b.name().to_string()))
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing::InMemoryBackingStore;
    use crate::cache::Blob;
    use crate::clock::ManualClock;
    use crate::error::BackingStoreError;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct TestKey(&'static str, &'static [&'static str]);

    impl CacheKey for TestKey {
        fn cache_key(&self) -> String {
            self.0.to_string()
        }

        fn tags(&self) -> Vec<String> {
            self.1.iter().map(|t| t.to_string()).collect()
        }
    }

    fn key(name: &'static str) -> TestKey {
        TestKey(name, &[])
    }

    fn cache_with(
        capacity: usize,
        backing: Option<Arc<dyn BackingStore>>,
        clock: Arc<ManualClock>,
    ) -> MultiLevelCache<TestKey, Blob> {
        MultiLevelCache::new(
            "test",
            capacity,
            4,
            backing,
            &InvalidationConfig::default(),
            BreakerConfig::default(),
            clock,
        )
    }

    struct DownStore;

    impl BackingStore for DownStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackingStoreError> {
            Err(BackingStoreError::Unavailable("down".into()))
        }
        fn put(&self, _: &str, _: Vec<u8>, _: Duration, _: &[String]) -> Result<(), BackingStoreError> {
            Err(BackingStoreError::Timeout(Duration::from_millis(5)))
        }
        fn remove(&self, _key: &str) -> Result<(), BackingStoreError> {
            Err(BackingStoreError::Unavailable("down".into()))
        }
        fn remove_matching(&self, _: &KeyPattern) -> Result<Vec<String>, BackingStoreError> {
            Err(BackingStoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_get_before_and_after_expiry() {
        let clock = ManualClock::shared();
        let cache = cache_with(16, None, clock.clone());

        assert!(cache.put(key("k1"), Blob::from("v1"), Duration::from_secs(1)).is_stored());
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get(&key("k1")), Some(Blob::from("v1")));

        clock.advance(Duration::from_millis(501));
        assert_eq!(cache.get(&key("k1")), None);
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_versions_strictly_increase() {
        let clock = ManualClock::shared();
        let cache = cache_with(16, None, clock);
        let ttl = Duration::from_secs(10);

        let mut last = 0;
        for _ in 0..5 {
            match cache.put(key("k"), Blob::from("v"), ttl) {
                PutOutcome::Stored { version } => {
                    assert!(version > last);
                    last = version;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(cache.lookup(&key("k")).unwrap().version, last);
    }

    #[test]
    fn test_stale_ticket_is_dropped_after_invalidation() {
        let clock = ManualClock::shared();
        let cache = cache_with(16, None, clock);
        let ttl = Duration::from_secs(10);

        let ticket = cache.ticket();
        cache.invalidate(&KeyPattern::Exact("k".into()));
        let outcome = cache.put_with(key("k"), Blob::from("stale"), ttl, ticket, &[]);
        assert_eq!(outcome, PutOutcome::Superseded);
        assert_eq!(cache.get(&key("k")), None);

        // Unrelated keys are unaffected by the tombstone
        assert!(cache
            .put_with(key("other"), Blob::from("v"), ttl, ticket, &[])
            .is_stored());

        // A ticket taken after the invalidation stores normally
        assert!(cache
            .put_with(key("k"), Blob::from("fresh"), ttl, cache.ticket(), &[])
            .is_stored());
        assert_eq!(cache.stats().superseded_puts, 1);
    }

    #[test]
    fn test_invalidate_by_prefix_and_tag() {
        let clock = ManualClock::shared();
        let cache = cache_with(64, None, clock);
        let ttl = Duration::from_secs(10);

        cache.put(TestKey("resp:a:1", &["offer:1"]), Blob::from("1"), ttl);
        cache.put(TestKey("resp:a:2", &["offer:2"]), Blob::from("2"), ttl);
        cache.put(TestKey("resp:b:1", &["offer:1"]), Blob::from("3"), ttl);
        cache.put_with(
            TestKey("resp:c:1", &[]),
            Blob::from("4"),
            ttl,
            cache.ticket(),
            &["offer:1".to_string()],
        );

        let outcome = cache.invalidate(&KeyPattern::Tag("offer:1".into()));
        assert_eq!(
            outcome.affected_keys(),
            vec!["resp:a:1", "resp:b:1", "resp:c:1"]
        );

        let outcome = cache.invalidate(&KeyPattern::Prefix("resp:a".into()));
        assert_eq!(outcome.affected_keys(), vec!["resp:a:2"]);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidated, 4);
    }

    #[test]
    fn test_lru_eviction_is_bounded() {
        let clock = ManualClock::shared();
        let cache: MultiLevelCache<TestKey, Blob> = MultiLevelCache::new(
            "tiny",
            2,
            1,
            None,
            &InvalidationConfig::default(),
            BreakerConfig::default(),
            clock,
        );
        let ttl = Duration::from_secs(10);
        cache.put(key("a"), Blob::from("a"), ttl);
        cache.put(key("b"), Blob::from("b"), ttl);
        cache.get(&key("a"));
        cache.put(key("c"), Blob::from("c"), ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_backing_hit_populates_l1() {
        let clock = ManualClock::shared();
        let backing: Arc<dyn BackingStore> = Arc::new(InMemoryBackingStore::new(clock.clone()));
        let writer = cache_with(16, Some(backing.clone()), clock.clone());
        let reader = cache_with(16, Some(backing), clock.clone());

        writer.put(key("k"), Blob::from("shared"), Duration::from_secs(5));
        clock.advance(Duration::from_secs(2));

        let hit = reader.lookup(&key("k")).unwrap();
        assert_eq!(hit.level, CacheLevel::L2);
        assert_eq!(hit.value, Blob::from("shared"));
        assert!(reader.ticket().0 >= hit.version);

        let hit = reader.lookup(&key("k")).unwrap();
        assert_eq!(hit.level, CacheLevel::L1);

        // Remaining lifetime carries over from the writer
        clock.advance(Duration::from_secs(3));
        assert!(reader.get(&key("k")).is_none());
    }

    #[test]
    fn test_backing_invalidation_reaches_other_instances() {
        let clock = ManualClock::shared();
        let backing: Arc<dyn BackingStore> = Arc::new(InMemoryBackingStore::new(clock.clone()));
        let a = cache_with(16, Some(backing.clone()), clock.clone());
        let b = cache_with(16, Some(backing), clock);

        a.put(key("k"), Blob::from("v"), Duration::from_secs(60));
        a.invalidate(&KeyPattern::Exact("k".into()));
        assert!(b.get(&key("k")).is_none());
    }

    #[test]
    fn test_corrupt_backing_entry_is_a_miss() {
        let clock = ManualClock::shared();
        let store = Arc::new(InMemoryBackingStore::new(clock.clone()));
        let backing: Arc<dyn BackingStore> = store.clone();
        let writer = cache_with(16, Some(backing.clone()), clock.clone());
        let reader = cache_with(16, Some(backing), clock);

        writer.put(key("k"), Blob::from("v"), Duration::from_secs(60));
        assert!(store.corrupt("k", vec![1, 2, 3, 4, 5, 6]));

        assert!(reader.get(&key("k")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_backing_failure_degrades_to_l1() {
        let clock = ManualClock::shared();
        let backing: Arc<dyn BackingStore> = Arc::new(DownStore);
        let cache = cache_with(16, Some(backing), clock);
        let ttl = Duration::from_secs(60);

        assert!(cache.put(key("k"), Blob::from("v"), ttl).is_stored());
        assert_eq!(cache.get(&key("k")), Some(Blob::from("v")));
        assert!(cache.get(&key("missing")).is_none());

        let outcome = cache.invalidate(&KeyPattern::Exact("k".into()));
        assert_eq!(outcome.removed.len(), 1);
        assert!(outcome.backing_error.is_some());
        assert!(cache.stats().backing_errors >= 3);
    }

    #[test]
    fn test_breaker_opens_and_skips_backing() {
        let clock = ManualClock::shared();
        let backing: Arc<dyn BackingStore> = Arc::new(DownStore);
        let cache = cache_with(16, Some(backing), clock.clone());

        for _ in 0..BreakerConfig::default().failure_threshold {
            assert!(cache.get(&key("missing")).is_none());
        }
        assert_eq!(cache.breaker_state(), BreakerState::Open);

        let errors = cache.stats().backing_errors;
        assert!(cache.get(&key("missing")).is_none());
        assert_eq!(cache.stats().backing_errors, errors);

        clock.advance(BreakerConfig::default().open_timeout);
        cache.get(&key("missing"));
        assert_eq!(cache.breaker_state(), BreakerState::Open);
        assert_eq!(cache.stats().backing_errors, errors + 1);
    }

    #[test]
    fn test_tombstone_pruning_raises_floor() {
        let clock = ManualClock::shared();
        let cache = cache_with(16, None, clock.clone());
        let ttl = Duration::from_secs(10);

        let old_ticket = cache.ticket();
        cache.invalidate(&KeyPattern::Exact("x".into()));
        assert_eq!(cache.tombstone_count(), 1);

        clock.advance(InvalidationConfig::default().tombstone_retention);
        assert_eq!(cache.prune_tombstones(), 1);
        assert_eq!(cache.tombstone_count(), 0);

        // Tickets from before the pruned tombstone can no longer be trusted
        assert_eq!(
            cache.put_with(key("y"), Blob::from("v"), ttl, old_ticket, &[]),
            PutOutcome::Superseded
        );
        assert!(cache.put(key("y"), Blob::from("v"), ttl).is_stored());
    }

    #[test]
    fn test_purge_expired_and_warm() {
        let clock = ManualClock::shared();
        let cache = cache_with(16, None, clock.clone());
        let stored = cache.warm(vec![
            (key("a"), Blob::from("a"), Duration::from_secs(1)),
            (key("b"), Blob::from("b"), Duration::from_secs(10)),
            (key("c"), Blob::from("c"), Duration::ZERO),
        ]);
        assert_eq!(stored, 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.stats().current_memory_bytes > 0);
    }
}
