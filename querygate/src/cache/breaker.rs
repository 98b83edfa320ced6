// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Circuit breaker around backing-layer calls
//!
//! Closed: calls pass, consecutive failures are counted. Open: calls are
//! skipped until `open_timeout` has passed. HalfOpen: calls pass as probes;
//! enough successes close the breaker, any failure reopens it.
//!
//! State lives in atomics so the hot path never takes a lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    /// Nanoseconds since `epoch` when the breaker last opened
    opened_at: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            epoch,
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    fn elapsed_nanos(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.epoch)
            .as_nanos() as u64
    }

    /// Whether a backing call may be attempted now
    pub fn allow_request(&self) -> bool {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let open_for = Duration::from_nanos(self.elapsed_nanos().saturating_sub(opened_at));
                if open_for < self.config.open_timeout {
                    return false;
                }
                if self.transition(BreakerState::Open, BreakerState::HalfOpen) {
                    self.half_open_successes.store(0, Ordering::Release);
                    log::info!("Circuit breaker '{}' half-open, probing backing store", self.name);
                }
                true
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self.transition(BreakerState::HalfOpen, BreakerState::Closed)
                {
                    self.consecutive_failures.store(0, Ordering::Release);
                    log::info!("Circuit breaker '{}' closed", self.name);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip(BreakerState::Closed, failures);
                }
            }
            BreakerState::HalfOpen => self.trip(BreakerState::HalfOpen, 1),
            BreakerState::Open => {}
        }
    }

    fn trip(&self, from: BreakerState, failures: u32) {
        self.opened_at.store(self.elapsed_nanos(), Ordering::Release);
        if self.transition(from, BreakerState::Open) {
            self.trips.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Circuit breaker '{}' opened after {} failure(s); backing store bypassed for {:?}",
                self.name,
                failures,
                self.config.open_timeout
            );
        }
    }

    fn transition(&self, from: BreakerState, to: BreakerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("trips", &self.trips())
            .finish()
    }
}
