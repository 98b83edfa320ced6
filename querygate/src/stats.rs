// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Access statistics store
//!
//! Bounded, sharded table of per-key access frequency and volatility. Both
//! values decay exponentially with a fixed half-life, applied lazily on each
//! record. Losing a stat (eviction, restart) only makes TTL predictions
//! fall back to the base TTL.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::lru::LruMap;
use crate::clock::Clock;
use crate::config::AccessStatsConfig;

/// Invalidation timestamps kept per key
const MAX_RECENT_INVALIDATIONS: usize = 64;

/// Point-in-time view of one key's statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessStat {
    pub key: String,
    /// Decayed access count
    pub windowed_frequency: f64,
    /// Decayed count of invalidations that came before the predicted expiry
    pub volatility_score: f64,
    #[serde(skip)]
    pub last_invalidated_at: Option<Instant>,
    /// Invalidations inside the configured rolling window
    pub invalidations_in_window: u32,
}

#[derive(Debug, Clone)]
struct StatRecord {
    frequency: f64,
    volatility: f64,
    updated_at: Instant,
    last_invalidated_at: Option<Instant>,
    expected_expiry: Option<Instant>,
    recent_invalidations: VecDeque<Instant>,
}

impl StatRecord {
    fn new(now: Instant) -> Self {
        Self {
            frequency: 0.0,
            volatility: 0.0,
            updated_at: now,
            last_invalidated_at: None,
            expected_expiry: None,
            recent_invalidations: VecDeque::new(),
        }
    }

    fn decay_factor(&self, now: Instant, half_life: Duration) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated_at);
        0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
    }

    fn decay(&mut self, now: Instant, half_life: Duration) {
        let factor = self.decay_factor(now, half_life);
        self.frequency *= factor;
        self.volatility *= factor;
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn invalidations_since(&self, cutoff: Option<Instant>) -> u32 {
        match cutoff {
            Some(cutoff) => self
                .recent_invalidations
                .iter()
                .filter(|at| **at > cutoff)
                .count() as u32,
            None => self.recent_invalidations.len() as u32,
        }
    }
}

pub struct AccessStatisticsStore {
    shards: Vec<Mutex<LruMap<String, StatRecord>>>,
    half_life: Duration,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl AccessStatisticsStore {
    pub fn new(config: &AccessStatsConfig, shard_count: usize, clock: Arc<dyn Clock>) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (config.capacity / shard_count).max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruMap::new(per_shard)))
                .collect(),
            half_life: config.half_life,
            window: config.invalidation_window,
            clock,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<LruMap<String, StatRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Apply `update` to the key's record, creating it if needed
    fn update<F: FnOnce(&mut StatRecord, Instant)>(&self, key: &str, update: F) {
        let now = self.clock.now();
        let mut shard = self.shard(key).lock();
        let owned_key = key.to_string();
        if shard.get_mut(&owned_key).is_none() {
            shard.insert(owned_key.clone(), StatRecord::new(now));
        }
        if let Some(record) = shard.get_mut(&owned_key) {
            record.decay(now, self.half_life);
            update(record, now);
        }
    }

    pub fn record_access(&self, key: &str) {
        self.update(key, |record, _| record.frequency += 1.0);
    }

    /// Remember when the key is expected to expire
    pub fn record_store(&self, key: &str, ttl: Duration) {
        self.update(key, |record, now| record.expected_expiry = Some(now + ttl));
    }

    pub fn record_invalidation(&self, key: &str) {
        let window = self.window;
        self.update(key, |record, now| {
            let early = record.expected_expiry.map_or(true, |expiry| now < expiry);
            if early {
                record.volatility += 1.0;
            }
            record.last_invalidated_at = Some(now);
            record.expected_expiry = None;

            record.recent_invalidations.push_back(now);
            if let Some(cutoff) = now.checked_sub(window) {
                while record
                    .recent_invalidations
                    .front()
                    .map_or(false, |at| *at <= cutoff)
                {
                    record.recent_invalidations.pop_front();
                }
            }
            while record.recent_invalidations.len() > MAX_RECENT_INVALIDATIONS {
                record.recent_invalidations.pop_front();
            }
        });
    }

    /// Decayed view of the key's statistics, if tracked
    pub fn get(&self, key: &str) -> Option<AccessStat> {
        let now = self.clock.now();
        let shard = self.shard(key).lock();
        let record = shard.peek(&key.to_string())?;
        let factor = record.decay_factor(now, self.half_life);
        Some(AccessStat {
            key: key.to_string(),
            windowed_frequency: record.frequency * factor,
            volatility_score: record.volatility * factor,
            last_invalidated_at: record.last_invalidated_at,
            invalidations_in_window: record.invalidations_since(now.checked_sub(self.window)),
        })
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(capacity: usize) -> (Arc<ManualClock>, AccessStatisticsStore) {
        let clock = ManualClock::shared();
        let config = AccessStatsConfig {
            capacity,
            half_life: Duration::from_secs(60),
            invalidation_window: Duration::from_secs(60),
        };
        (clock.clone(), AccessStatisticsStore::new(&config, 2, clock))
    }

    #[test]
    fn test_unknown_key_has_no_stat() {
        let (_clock, stats) = store(16);
        assert!(stats.get("nope").is_none());
    }

    #[test]
    fn test_frequency_decays_with_half_life() {
        let (clock, stats) = store(16);
        for _ in 0..8 {
            stats.record_access("k");
        }
        assert_eq!(stats.get("k").unwrap().windowed_frequency, 8.0);

        clock.advance(Duration::from_secs(60));
        let stat = stats.get("k").unwrap();
        assert!((stat.windowed_frequency - 4.0).abs() < 1e-9);

        stats.record_access("k");
        assert!((stats.get("k").unwrap().windowed_frequency - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_early_invalidation_raises_volatility() {
        let (clock, stats) = store(16);
        stats.record_store("k", Duration::from_secs(30));
        clock.advance(Duration::from_secs(10));
        stats.record_invalidation("k");
        assert_eq!(stats.get("k").unwrap().volatility_score, 1.0);

        // Invalidated after its predicted expiry: not volatile
        stats.record_store("k", Duration::from_secs(5));
        clock.advance(Duration::from_secs(10));
        stats.record_invalidation("k");
        let stat = stats.get("k").unwrap();
        assert!(stat.volatility_score < 1.0);
        assert_eq!(stat.invalidations_in_window, 2);
        assert!(stat.last_invalidated_at.is_some());
    }

    #[test]
    fn test_invalidation_window_rolls() {
        let (clock, stats) = store(16);
        for _ in 0..5 {
            stats.record_invalidation("k");
            clock.advance(Duration::from_secs(5));
        }
        assert_eq!(stats.get("k").unwrap().invalidations_in_window, 5);

        clock.advance(Duration::from_secs(60));
        assert_eq!(stats.get("k").unwrap().invalidations_in_window, 0);
    }

    #[test]
    fn test_store_is_bounded() {
        let (_clock, stats) = store(4);
        for i in 0..100 {
            stats.record_access(&format!("key-{}", i));
        }
        assert!(stats.len() <= 4);
    }
}
