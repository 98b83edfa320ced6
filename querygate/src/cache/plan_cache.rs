// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Compiled execution plan cache
//!
//! Plans depend only on the query shape, so the key is the normalized query
//! hash and the lifetime is long and fixed.

use std::sync::Arc;
use std::time::Duration;

use super::backing::BackingStore;
use super::multi_level::{InvalidationOutcome, MultiLevelCache, PutOutcome, StoreTicket};
use super::{Blob, CacheKey, CacheStats, KeyPattern};
use crate::clock::Clock;
use crate::config::{BreakerConfig, InvalidationConfig, PlanCacheConfig};
use crate::query::QueryHash;

/// Key for plan cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub query_hash: QueryHash,
}

impl PlanCacheKey {
    pub fn new(query_hash: QueryHash) -> Self {
        Self { query_hash }
    }
}

impl CacheKey for PlanCacheKey {
    fn cache_key(&self) -> String {
        format!("plan:{}", self.query_hash)
    }

    fn tags(&self) -> Vec<String> {
        vec![format!("query:{}", self.query_hash)]
    }
}

/// Plan cache implementation
pub struct PlanCache {
    cache: MultiLevelCache<PlanCacheKey, Blob>,
    ttl: Duration,
}

impl PlanCache {
    pub fn new(
        config: &PlanCacheConfig,
        shards: usize,
        backing: Option<Arc<dyn BackingStore>>,
        invalidation: &InvalidationConfig,
        breaker: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: MultiLevelCache::new(
                "plan-cache",
                config.capacity,
                shards,
                backing,
                invalidation,
                breaker,
                clock,
            ),
            ttl: config.ttl,
        }
    }

    pub fn get(&self, query_hash: QueryHash) -> Option<Blob> {
        self.cache.get(&PlanCacheKey::new(query_hash))
    }

    pub fn insert(&self, query_hash: QueryHash, plan: Blob) -> PutOutcome {
        self.cache.put(PlanCacheKey::new(query_hash), plan, self.ttl)
    }

    /// Insert a plan compiled after `ticket` was observed
    pub fn insert_with_ticket(
        &self,
        query_hash: QueryHash,
        plan: Blob,
        ticket: StoreTicket,
    ) -> PutOutcome {
        self.cache
            .put_with(PlanCacheKey::new(query_hash), plan, self.ttl, ticket, &[])
    }

    /// Invalidate plans, e.g. `plan:*` after a schema change
    pub fn invalidate(&self, pattern: &KeyPattern) -> InvalidationOutcome {
        self.cache.invalidate(pattern)
    }

    pub fn warm<I>(&self, plans: I) -> usize
    where
        I: IntoIterator<Item = (QueryHash, Blob)>,
    {
        let ttl = self.ttl;
        self.cache.warm(
            plans
                .into_iter()
                .map(|(hash, plan)| (PlanCacheKey::new(hash), plan, ttl)),
        )
    }

    pub fn ticket(&self) -> StoreTicket {
        self.cache.ticket()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
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
