// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Shared backing layer
//!
//! The backing layer is an external key-value store shared between gateway
//! processes. It stores opaque bytes with a TTL and a set of tags, and it
//! evicts by TTL only. Calls may be slow or fail; the cache in front of it
//! treats every failure as a miss.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::KeyPattern;
use crate::clock::Clock;
use crate::error::BackingStoreError;

/// Shared key-value store behind the in-process cache level
///
/// Implementations must apply their own I/O timeouts and report them as
/// [`BackingStoreError::Timeout`].
pub trait BackingStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackingStoreError>;

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), BackingStoreError>;

    fn remove(&self, key: &str) -> Result<(), BackingStoreError>;

    /// Remove every key matching `pattern`, returning the removed keys
    fn remove_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>, BackingStoreError>;

    fn name(&self) -> &str {
        "backing"
    }
}

#[derive(Debug, Clone)]
struct StoredBytes {
    bytes: Vec<u8>,
    expires_at_ms: u64,
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct Contents {
    entries: BTreeMap<String, StoredBytes>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl Contents {
    fn remove(&mut self, key: &str) -> Option<StoredBytes> {
        let stored = self.entries.remove(key)?;
        for tag in &stored.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(stored)
    }
}

/// Process-local backing store
///
/// Useful for single-process deployments and tests. Expiry is checked
/// against the injected clock's wall time.
pub struct InMemoryBackingStore {
    contents: RwLock<Contents>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            contents: RwLock::new(Contents::default()),
            clock,
        }
    }

    /// Number of stored keys, expired or not
    pub fn len(&self) -> usize {
        self.contents.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.wall_millis();
        let mut contents = self.contents.write();
        let expired: Vec<String> = contents
            .entries
            .iter()
            .filter(|(_, stored)| stored.expires_at_ms <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            contents.remove(key);
        }
        expired.len()
    }

    /// Overwrite the raw bytes of an existing key, keeping its expiry
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str, bytes: Vec<u8>) -> bool {
        match self.contents.write().entries.get_mut(key) {
            Some(stored) => {
                stored.bytes = bytes;
                true
            }
            None => false,
        }
    }
}

impl BackingStore for InMemoryBackingStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackingStoreError> {
        let now_ms = self.clock.wall_millis();
        {
            let contents = self.contents.read();
            match contents.entries.get(key) {
                None => return Ok(None),
                Some(stored) if stored.expires_at_ms > now_ms => {
                    return Ok(Some(stored.bytes.clone()))
                }
                Some(_) => {}
            }
        }

        // Expired: drop it lazily unless it was rewritten meanwhile
        let mut contents = self.contents.write();
        if contents
            .entries
            .get(key)
            .map_or(false, |stored| stored.expires_at_ms <= now_ms)
        {
            contents.remove(key);
        }
        Ok(None)
    }

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), BackingStoreError> {
        let expires_at_ms = self
            .clock
            .wall_millis()
            .saturating_add(ttl.as_millis() as u64);

        let mut contents = self.contents.write();
        contents.remove(key);
        for tag in tags {
            contents
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        contents.entries.insert(
            key.to_string(),
            StoredBytes {
                bytes: value,
                expires_at_ms,
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackingStoreError> {
        self.contents.write().remove(key);
        Ok(())
    }

    fn remove_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>, BackingStoreError> {
        let mut contents = self.contents.write();
        let keys: Vec<String> = match pattern {
            KeyPattern::Exact(key) => contents
                .entries
                .contains_key(key)
                .then(|| vec![key.clone()])
                .unwrap_or_default(),
            KeyPattern::Prefix(prefix) => contents
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(prefix.as_str()))
                .map(|(key, _)| key.clone())
                .collect(),
            KeyPattern::Tag(tag) => contents
                .by_tag
                .get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        };

        for key in &keys {
            contents.remove(key);
        }
        Ok(keys)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
