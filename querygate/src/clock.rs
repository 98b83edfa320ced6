// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Time sources
//!
//! Every component reads time through a [`Clock`] handed to it at
//! construction. In-process bookkeeping uses monotonic `Instant`s; anything
//! written to the shared backing layer uses wall-clock time because other
//! processes read it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn wall(&self) -> SystemTime;

    /// Wall-clock time as milliseconds since the Unix epoch
    fn wall_millis(&self) -> u64 {
        self.wall()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Real time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
///
/// Both the monotonic and the wall-clock readings advance together, so
/// expiry computed on either side stays consistent.
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_wall: SystemTime,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: SystemTime::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn wall(&self) -> SystemTime {
        self.base_wall + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_wall = clock.wall_millis();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.now() - start, Duration::from_millis(1500));
        assert_eq!(clock.wall_millis() - start_wall, 1500);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(clock.wall_millis() > 0);
    }
}
