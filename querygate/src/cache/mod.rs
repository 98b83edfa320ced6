// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Multi-level caching
//!
//! This module provides the generic two-level cache and its two configured
//! instances:
//! - Compiled execution plans, keyed by query shape
//! - Response fragments, keyed by query shape, arguments and requester scope
//!
//! The in-process level (L1) is a sharded LRU. The shared level (L2) is an
//! external key-value store reached through [`backing::BackingStore`].

pub mod backing;
pub mod breaker;
pub mod codec;
pub mod lru;
pub mod multi_level;
pub mod plan_cache;
pub mod response_cache;

pub use backing::{BackingStore, InMemoryBackingStore};
pub use breaker::{BreakerState, CircuitBreaker};
pub use multi_level::{InvalidationOutcome, MultiLevelCache, PutOutcome, StoreTicket};
pub use plan_cache::{PlanCache, PlanCacheKey};
pub use response_cache::{ResponseCache, ResponseCacheKey};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};

/// Cache levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLevel {
    /// L1: in-process, bounded, per-shard LRU
    L1,
    /// L2: shared backing store, TTL-only eviction
    L2,
}

/// Generic cache key trait
pub trait CacheKey:
    std::fmt::Debug + Clone + PartialEq + Eq + std::hash::Hash + Send + Sync + 'static
{
    /// Stable string form; used for prefix matching and as the backing-store key
    fn cache_key(&self) -> String;

    /// Tags the entry is reachable by for invalidation
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Generic cached value trait
pub trait CacheValue:
    std::fmt::Debug + Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static
{
    fn size_bytes(&self) -> usize;
}

/// Opaque byte payload (execution plan or response fragment)
///
/// Cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Blob(Arc<[u8]>);

impl Blob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for Blob {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Blob::new)
    }
}

impl CacheValue for Blob {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.len()
    }
}

/// Which keys an invalidation reaches
///
/// Text form: `tag:<tag>`, `<prefix>*`, or an exact key. Matching is never a
/// general regex so it stays proportional to the number of matching keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
    Tag(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> EngineResult<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(EngineError::invalid_pattern(pattern, "pattern is empty"));
        }

        if let Some(tag) = trimmed.strip_prefix("tag:") {
            if tag.is_empty() {
                return Err(EngineError::invalid_pattern(pattern, "tag is empty"));
            }
            if tag.contains('*') {
                return Err(EngineError::invalid_pattern(
                    pattern,
                    "tags do not support wildcards",
                ));
            }
            return Ok(KeyPattern::Tag(tag.to_string()));
        }

        match trimmed.find('*') {
            None => Ok(KeyPattern::Exact(trimmed.to_string())),
            Some(pos) if pos == trimmed.len() - 1 => {
                let prefix = &trimmed[..pos];
                if prefix.is_empty() {
                    Err(EngineError::invalid_pattern(
                        pattern,
                        "prefix is empty; match-all invalidation is not allowed",
                    ))
                } else {
                    Ok(KeyPattern::Prefix(prefix.to_string()))
                }
            }
            Some(_) => Err(EngineError::invalid_pattern(
                pattern,
                "wildcard is only allowed at the end",
            )),
        }
    }

    pub fn matches(&self, key: &str, tags: &[String]) -> bool {
        match self {
            KeyPattern::Exact(exact) => key == exact,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Tag(tag) => tags.iter().any(|t| t == tag),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{}", key),
            KeyPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            KeyPattern::Tag(tag) => write!(f, "tag:{}", tag),
        }
    }
}

impl std::str::FromStr for KeyPattern {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyPattern::parse(s)
    }
}

/// Entry held by the in-process level
#[derive(Debug, Clone)]
pub struct CacheEntry<K, V> {
    pub key: K,
    /// `key.cache_key()`, kept to avoid re-rendering on every index update
    pub rendered_key: String,
    pub value: V,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub version: u64,
    pub tags: Vec<String>,
    pub size_bytes: usize,
}

impl<K, V> CacheEntry<K, V> {
    pub fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn update_access(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }
}

/// Successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit<V> {
    pub value: V,
    pub level: CacheLevel,
    pub version: u64,
    pub stored_at: Instant,
    pub ttl: Duration,
}

/// Entry removed by an invalidation
#[derive(Debug, Clone)]
pub struct RemovedEntry {
    pub key: String,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub version: u64,
}

/// Cache statistics snapshot
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub superseded_puts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidated: u64,
    pub backing_errors: u64,
    pub current_entries: usize,
    pub current_memory_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.l1_hits + self.l2_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / total as f64
        }
    }

    pub fn l1_hit_rate(&self) -> f64 {
        let total = self.l1_hits + self.l2_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.l1_hits as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    pub superseded_puts: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub invalidated: AtomicU64,
    pub backing_errors: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, current_entries: usize, current_memory_bytes: usize) -> CacheStats {
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            superseded_puts: self.superseded_puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            backing_errors: self.backing_errors.load(Ordering::Relaxed),
            current_entries,
            current_memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(
            KeyPattern::parse("tag:offer:42").unwrap(),
            KeyPattern::Tag("offer:42".into())
        );
        assert_eq!(
            KeyPattern::parse("resp:00ab*").unwrap(),
            KeyPattern::Prefix("resp:00ab".into())
        );
        assert_eq!(
            KeyPattern::parse("plan:1").unwrap(),
            KeyPattern::Exact("plan:1".into())
        );
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["", "   ", "*", "tag:", "a*b", "tag:x*"] {
            let err = KeyPattern::parse(bad).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidKeyPattern { .. }),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_pattern_matching() {
        let tags = vec!["offer:42".to_string()];
        assert!(KeyPattern::Tag("offer:42".into()).matches("resp:1", &tags));
        assert!(!KeyPattern::Tag("offer:7".into()).matches("resp:1", &tags));
        assert!(KeyPattern::Prefix("resp:".into()).matches("resp:1", &[]));
        assert!(!KeyPattern::Prefix("plan:".into()).matches("resp:1", &[]));
        assert!(KeyPattern::Exact("resp:1".into()).matches("resp:1", &[]));
        assert!(!KeyPattern::Exact("resp:1".into()).matches("resp:10", &[]));
    }

    #[test]
    fn test_pattern_display_round_trips() {
        for text in ["tag:user:1", "resp:*", "plan:abc"] {
            assert_eq!(KeyPattern::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_stats_hit_rate() {
        let stats = CacheStats {
            l1_hits: 6,
            l2_hits: 2,
            misses: 2,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.8);
        assert_eq!(stats.l1_hit_rate(), 0.6);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
