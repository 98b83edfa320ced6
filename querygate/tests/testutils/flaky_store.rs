//! Backing store whose availability can be toggled and whose bytes can be
//! garbled per key

use parking_lot::Mutex;
use querygate::cache::KeyPattern;
use querygate::{BackingStore, BackingStoreError, InMemoryBackingStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub struct FlakyBackingStore {
    inner: InMemoryBackingStore,
    available: AtomicBool,
    calls: AtomicU64,
    /// Bytes served instead of the stored ones, until the key is rewritten or removed
    garbled: Mutex<HashMap<String, Vec<u8>>>,
}

impl FlakyBackingStore {
    pub fn new(inner: InMemoryBackingStore) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
            garbled: Mutex::new(HashMap::new()),
        }
    }

    /// Serve `bytes` for `key` while the inner store still holds it
    pub fn garble(&self, key: &str, bytes: Vec<u8>) {
        self.garbled.lock().insert(key.to_string(), bytes);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Calls that reached the store, failed or not
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryBackingStore {
        &self.inner
    }

    fn check(&self) -> Result<(), BackingStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackingStoreError::Unavailable("connection refused".into()))
        }
    }
}

impl BackingStore for FlakyBackingStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackingStoreError> {
        self.check()?;
        let stored = self.inner.get(key)?;
        match (stored, self.garbled.lock().get(key)) {
            (Some(_), Some(bytes)) => Ok(Some(bytes.clone())),
            (stored, _) => Ok(stored),
        }
    }

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), BackingStoreError> {
        self.check()?;
        self.garbled.lock().remove(key);
        self.inner.put(key, value, ttl, tags)
    }

    fn remove(&self, key: &str) -> Result<(), BackingStoreError> {
        self.check()?;
        self.garbled.lock().remove(key);
        self.inner.remove(key)
    }

    fn remove_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>, BackingStoreError> {
        self.check()?;
        let removed = self.inner.remove_matching(pattern)?;
        let mut garbled = self.garbled.lock();
        for key in &removed {
            garbled.remove(key);
        }
        Ok(removed)
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
