// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Response fragment cache
//!
//! Keyed by query shape, argument hash and an optional requester scope for
//! personalized fields. Lifetimes are chosen per entry by the caller.

use std::sync::Arc;
use std::time::Duration;

use super::backing::BackingStore;
use super::multi_level::{InvalidationOutcome, MultiLevelCache, PutOutcome, StoreTicket};
use super::{Blob, CacheHit, CacheKey, CacheStats, KeyPattern};
use crate::clock::Clock;
use crate::config::{BreakerConfig, InvalidationConfig, ResponseCacheConfig};
use crate::query::QueryHash;

/// Key for response cache entries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseCacheKey {
    pub query_hash: QueryHash,
    pub args_hash: u64,
    /// Requester scope for personalized responses; `None` when shared
    pub scope: Option<String>,
}

impl ResponseCacheKey {
    pub fn new(query_hash: QueryHash, args_hash: u64, scope: Option<String>) -> Self {
        Self {
            query_hash,
            args_hash,
            scope,
        }
    }

    /// Prefix shared by every argument/scope variant of one query shape
    pub fn query_prefix(query_hash: QueryHash) -> String {
        format!("resp:{}:", query_hash)
    }
}

impl CacheKey for ResponseCacheKey {
    /// Shared keys end in `-`, scoped ones in `s:<scope>`
    fn cache_key(&self) -> String {
        match &self.scope {
            Some(scope) => format!(
                "resp:{}:{:016x}:s:{}",
                self.query_hash, self.args_hash, scope
            ),
            None => format!("resp:{}:{:016x}:-", self.query_hash, self.args_hash),
        }
    }

    fn tags(&self) -> Vec<String> {
        let mut tags = vec![format!("query:{}", self.query_hash)];
        if let Some(scope) = &self.scope {
            tags.push(format!("scope:{}", scope));
        }
        tags
    }
}

/// Response cache implementation
pub struct ResponseCache {
    cache: MultiLevelCache<ResponseCacheKey, Blob>,
    max_entry_bytes: usize,
}

impl ResponseCache {
    pub fn new(
        config: &ResponseCacheConfig,
        shards: usize,
        backing: Option<Arc<dyn BackingStore>>,
        invalidation: &InvalidationConfig,
        breaker: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: MultiLevelCache::new(
                "response-cache",
                config.capacity,
                shards,
                backing,
                invalidation,
                breaker,
                clock,
            ),
            max_entry_bytes: config.max_entry_bytes,
        }
    }

    pub fn get(&self, key: &ResponseCacheKey) -> Option<Blob> {
        self.cache.get(key)
    }

    pub fn lookup(&self, key: &ResponseCacheKey) -> Option<CacheHit<Blob>> {
        self.cache.lookup(key)
    }

    /// Store a fragment produced after `ticket` was observed
    ///
    /// `tags` are added to the key's own tags (e.g. the entities the
    /// fragment was built from). Oversized fragments are not stored.
    pub fn store(
        &self,
        key: ResponseCacheKey,
        value: Blob,
        ttl: Duration,
        ticket: StoreTicket,
        tags: &[String],
    ) -> PutOutcome {
        if value.len() > self.max_entry_bytes {
            log::debug!(
                "Not caching {}: {} bytes exceeds limit of {}",
                key.cache_key(),
                value.len(),
                self.max_entry_bytes
            );
            return PutOutcome::Skipped;
        }
        self.cache.put_with(key, value, ttl, ticket, tags)
    }

    pub fn invalidate(&self, pattern: &KeyPattern) -> InvalidationOutcome {
        self.cache.invalidate(pattern)
    }

    pub fn ticket(&self) -> StoreTicket {
        self.cache.ticket()
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn prune_tombstones(&self) -> usize {
        self.cache.prune_tombstones()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn response_cache(max_entry_bytes: usize) -> ResponseCache {
        ResponseCache::new(
            &ResponseCacheConfig {
                capacity: 32,
                max_entry_bytes,
            },
            4,
            None,
            &InvalidationConfig::default(),
            BreakerConfig::default(),
            ManualClock::shared(),
        )
    }

    #[test]
    fn test_key_format_and_tags() {
        let shared = ResponseCacheKey::new(QueryHash(1), 0xff, None);
        assert_eq!(
            shared.cache_key(),
            "resp:0000000000000001:00000000000000ff:-"
        );
        assert_eq!(shared.tags(), vec!["query:0000000000000001"]);

        let personal = ResponseCacheKey::new(QueryHash(1), 0xff, Some("user-7".into()));
        assert!(personal.cache_key().ends_with(":s:user-7"));
        assert!(personal.tags().contains(&"scope:user-7".to_string()));
        assert!(personal
            .cache_key()
            .starts_with(&ResponseCacheKey::query_prefix(QueryHash(1))));
    }

    #[test]
    fn test_scope_named_like_shared_marker_is_distinct() {
        let shared = ResponseCacheKey::new(QueryHash(1), 1, None);
        let dash = ResponseCacheKey::new(QueryHash(1), 1, Some("-".into()));
        let empty = ResponseCacheKey::new(QueryHash(1), 1, Some(String::new()));
        assert_ne!(shared.cache_key(), dash.cache_key());
        assert_ne!(shared.cache_key(), empty.cache_key());
        assert_ne!(dash.cache_key(), empty.cache_key());

        let cache = response_cache(1024);
        let ttl = Duration::from_secs(30);
        cache.store(dash.clone(), Blob::from("personal"), ttl, cache.ticket(), &[]);
        assert_eq!(cache.get(&shared), None);
        cache.store(shared.clone(), Blob::from("shared"), ttl, cache.ticket(), &[]);
        assert_eq!(cache.get(&dash), Some(Blob::from("personal")));
        assert_eq!(cache.get(&shared), Some(Blob::from("shared")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let cache = response_cache(1024);
        let ttl = Duration::from_secs(30);
        let alice = ResponseCacheKey::new(QueryHash(1), 1, Some("alice".into()));
        let bob = ResponseCacheKey::new(QueryHash(1), 1, Some("bob".into()));

        cache.store(alice.clone(), Blob::from("alice's"), ttl, cache.ticket(), &[]);
        assert_eq!(cache.get(&alice), Some(Blob::from("alice's")));
        assert_eq!(cache.get(&bob), None);

        cache.invalidate(&KeyPattern::Tag("scope:alice".into()));
        assert_eq!(cache.get(&alice), None);
    }

    #[test]
    fn test_entity_tags_and_query_prefix_invalidation() {
        let cache = response_cache(1024);
        let ttl = Duration::from_secs(30);
        for args in 0..3 {
            let key = ResponseCacheKey::new(QueryHash(5), args, None);
            let tags = vec![format!("offer:{}", args)];
            cache.store(key, Blob::from("r"), ttl, cache.ticket(), &tags);
        }
        cache.store(
            ResponseCacheKey::new(QueryHash(6), 0, None),
            Blob::from("other"),
            ttl,
            cache.ticket(),
            &[],
        );

        let outcome = cache.invalidate(&KeyPattern::Tag("offer:1".into()));
        assert_eq!(outcome.removed.len(), 1);

        let prefix = KeyPattern::Prefix(ResponseCacheKey::query_prefix(QueryHash(5)));
        assert_eq!(cache.invalidate(&prefix).removed.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_fragments_are_skipped() {
        let cache = response_cache(4);
        let key = ResponseCacheKey::new(QueryHash(1), 0, None);
        let outcome = cache.store(
            key.clone(),
            Blob::from("too large"),
            Duration::from_secs(5),
            cache.ticket(),
            &[],
        );
        assert_eq!(outcome, PutOutcome::Skipped);
        assert!(cache.get(&key).is_none());
    }
}
