// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Invalidation of cached responses on data changes
//!
//! Events come from the mutation/event pipeline outside the engine. Each
//! event names the affected keys by exact key, key prefix or tag. Matching
//! entries are removed from the response cache and every removed key is
//! reported to the access statistics store, so keys that keep changing earn
//! shorter lifetimes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::response_cache::ResponseCache;
use crate::cache::KeyPattern;
use crate::error::EngineResult;
use crate::stats::AccessStatisticsStore;

/// Notification that backend data changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub id: Uuid,
    /// `tag:<tag>`, `<prefix>*` or an exact key
    pub affected_key_pattern: String,
    /// Free-form origin, e.g. the mutation or service that caused it
    pub caused_by: String,
    pub occurred_at: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn new(affected_key_pattern: impl Into<String>, caused_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            affected_key_pattern: affected_key_pattern.into(),
            caused_by: caused_by.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Event for every entry tagged with `tag`
    pub fn for_tag(tag: &str, caused_by: impl Into<String>) -> Self {
        Self::new(format!("tag:{}", tag), caused_by)
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// What one event removed
#[derive(Debug, Clone)]
pub struct InvalidationReport {
    pub event_id: Uuid,
    pub pattern: KeyPattern,
    /// Cache version assigned to the invalidation
    pub version: u64,
    pub invalidated_keys: Vec<String>,
    /// Set when the shared layer could not be purged
    pub backing_error: Option<String>,
}

impl InvalidationReport {
    pub fn count(&self) -> usize {
        self.invalidated_keys.len()
    }
}

/// Entry in the recent-events history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub event: InvalidationEvent,
    pub keys_invalidated: usize,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InvalidationStats {
    pub total_events: u64,
    /// Events refused because their pattern did not parse
    pub rejected_events: u64,
    pub total_keys_invalidated: u64,
    pub backing_failures: u64,
}

pub struct Invalidator {
    responses: Arc<ResponseCache>,
    access_stats: Arc<AccessStatisticsStore>,
    stats: Mutex<InvalidationStats>,
    history: Mutex<VecDeque<InvalidationRecord>>,
    max_history_size: usize,
}

impl Invalidator {
    pub fn new(
        responses: Arc<ResponseCache>,
        access_stats: Arc<AccessStatisticsStore>,
        max_history_size: usize,
    ) -> Self {
        Self {
            responses,
            access_stats,
            stats: Mutex::new(InvalidationStats::default()),
            history: Mutex::new(VecDeque::new()),
            max_history_size,
        }
    }

    /// Apply one event
    ///
    /// Returns `InvalidKeyPattern` when the event's pattern is malformed; the
    /// caches are left untouched in that case.
    pub fn notify(&self, event: InvalidationEvent) -> EngineResult<InvalidationReport> {
        let pattern = match KeyPattern::parse(&event.affected_key_pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                self.stats.lock().rejected_events += 1;
                log::warn!(
                    "Rejected invalidation {} from '{}': {}",
                    event.id,
                    event.caused_by,
                    e
                );
                return Err(e);
            }
        };

        let outcome = self.responses.invalidate(&pattern);
        let invalidated_keys = outcome.affected_keys();
        for key in &invalidated_keys {
            self.access_stats.record_invalidation(key);
        }

        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            stats.total_keys_invalidated += invalidated_keys.len() as u64;
            if outcome.backing_error.is_some() {
                stats.backing_failures += 1;
            }
        }

        log::debug!(
            "Invalidation {} ('{}' from '{}') removed {} keys",
            event.id,
            pattern,
            event.caused_by,
            invalidated_keys.len()
        );

        let report = InvalidationReport {
            event_id: event.id,
            pattern,
            version: outcome.version,
            invalidated_keys,
            backing_error: outcome.backing_error,
        };
        self.record_history(event, report.count());
        Ok(report)
    }

    fn record_history(&self, event: InvalidationEvent, keys_invalidated: usize) {
        if self.max_history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(InvalidationRecord {
            event,
            keys_invalidated,
            processed_at: Utc::now(),
        });
        while history.len() > self.max_history_size {
            history.pop_front();
        }
    }

    pub fn stats(&self) -> InvalidationStats {
        self.stats.lock().clone()
    }

    /// Most recent events first
    pub fn recent_events(&self, limit: usize) -> Vec<InvalidationRecord> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }
}
