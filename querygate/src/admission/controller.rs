// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Per-requester, per-class admission decisions

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bucket::{BucketDecision, TokenBucket};
use crate::classify::classifier::CostClass;
use crate::clock::Clock;
use crate::config::{AdmissionConfig, ClassBudgets, LoadGovernorConfig};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    Admit,
    /// Admitted; the caller waits this long before executing
    Delay(Duration),
    /// Not admitted; `retry_after` hints when a token frees up
    Reject { retry_after: Option<Duration> },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, AdmissionDecision::Reject { .. })
    }
}

/// Token state of one requester
#[derive(Debug)]
struct RequesterBudget {
    budgets: ClassBudgets,
    buckets: [TokenBucket; 4],
    last_seen: Instant,
}

impl RequesterBudget {
    fn new(budgets: ClassBudgets, now: Instant) -> Self {
        Self {
            buckets: CostClass::ALL.map(|class| TokenBucket::full(budgets.get(class).capacity, now)),
            budgets,
            last_seen: now,
        }
    }

    /// Idle once every reservation has passed and nothing was asked for a while
    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let busy_until = self
            .buckets
            .iter()
            .map(|b| b.last_refill())
            .fold(self.last_seen, Instant::max);
        now.saturating_duration_since(busy_until) >= idle_timeout
    }
}

/// Load-based refill throttling with hysteresis
#[derive(Debug)]
struct LoadGovernor {
    config: LoadGovernorConfig,
    throttled: AtomicBool,
    last_load: AtomicU64,
}

impl LoadGovernor {
    fn new(config: LoadGovernorConfig) -> Self {
        Self {
            config,
            throttled: AtomicBool::new(false),
            last_load: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn observe(&self, load: f64) {
        if !load.is_finite() {
            log::debug!("Ignoring non-finite load reading");
            return;
        }
        self.last_load.store(load.to_bits(), Ordering::Relaxed);

        if load > self.config.high_water {
            if self
                .throttled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::warn!(
                    "Load {:.2} above high water {:.2}; refill rates scaled by {}",
                    load,
                    self.config.high_water,
                    self.config.throttle_factor
                );
            }
        } else if load < self.config.low_water
            && self
                .throttled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            log::info!(
                "Load {:.2} below low water {:.2}; refill rates restored",
                load,
                self.config.low_water
            );
        }
    }

    fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    fn rate_factor(&self) -> f64 {
        if self.is_throttled() {
            self.config.throttle_factor
        } else {
            1.0
        }
    }

    fn last_load(&self) -> f64 {
        f64::from_bits(self.last_load.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct ClassCounters {
    admitted: AtomicU64,
    delayed: AtomicU64,
    rejected: AtomicU64,
}

/// Admission counters for one class
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAdmissionStats {
    pub admitted: u64,
    pub delayed: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub by_class: BTreeMap<CostClass, ClassAdmissionStats>,
    pub throttled: bool,
    pub last_load: f64,
    pub active_requesters: usize,
}

impl AdmissionStats {
    pub fn total_rejected(&self) -> u64 {
        self.by_class.values().map(|c| c.rejected).sum()
    }
}

pub struct AdmissionController {
    shards: Vec<Mutex<HashMap<String, RequesterBudget>>>,
    defaults: ClassBudgets,
    overrides: HashMap<String, ClassBudgets>,
    idle_timeout: Duration,
    governor: LoadGovernor,
    counters: [ClassCounters; 4],
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig, shard_count: usize, clock: Arc<dyn Clock>) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            defaults: config.budgets,
            overrides: config.requester_overrides.clone(),
            idle_timeout: config.idle_timeout,
            governor: LoadGovernor::new(config.load),
            counters: Default::default(),
            clock,
        }
    }

    fn shard(&self, requester: &str) -> &Mutex<HashMap<String, RequesterBudget>> {
        let mut hasher = DefaultHasher::new();
        requester.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn budgets_for(&self, requester: &str) -> ClassBudgets {
        self.overrides
            .get(requester)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Decide whether `requester` may run a query of `class` now
    pub fn evaluate(&self, requester: &str, class: CostClass) -> AdmissionDecision {
        let now = self.clock.now();
        let rate_factor = self.governor.rate_factor();

        let outcome = {
            let mut shard = self.shard(requester).lock();
            let budget = shard
                .entry(requester.to_string())
                .or_insert_with(|| RequesterBudget::new(self.budgets_for(requester), now));
            budget.last_seen = budget.last_seen.max(now);
            let class_budget = *budget.budgets.get(class);
            budget.buckets[class.index()].try_acquire(now, &class_budget, rate_factor)
        };

        let counters = &self.counters[class.index()];
        let decision = match outcome {
            BucketDecision::Admit => {
                counters.admitted.fetch_add(1, Ordering::Relaxed);
                AdmissionDecision::Admit
            }
            BucketDecision::Delay(wait) => {
                counters.delayed.fetch_add(1, Ordering::Relaxed);
                AdmissionDecision::Delay(wait)
            }
            BucketDecision::Reject(retry_after) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                AdmissionDecision::Reject { retry_after }
            }
        };

        log::debug!("Admission {} / {}: {:?}", requester, class, decision);
        decision
    }

    /// Feed the external load gauge
    pub fn observe_load(&self, load: f64) {
        self.governor.observe(load);
    }

    pub fn is_throttled(&self) -> bool {
        self.governor.is_throttled()
    }

    /// Tokens currently available, if the requester is known
    pub fn available_tokens(&self, requester: &str, class: CostClass) -> Option<f64> {
        let now = self.clock.now();
        let shard = self.shard(requester).lock();
        let budget = shard.get(requester)?;
        Some(budget.buckets[class.index()].available(
            now,
            budget.budgets.get(class),
            self.governor.rate_factor(),
        ))
    }

    /// Drop budgets idle for longer than the configured timeout
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_timeout = self.idle_timeout;
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, budget| !budget.is_idle(now, idle_timeout));
            evicted += before - shard.len();
        }
        if evicted > 0 {
            log::debug!("Evicted {} idle requester budgets", evicted);
        }
        evicted
    }

    pub fn requester_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn stats(&self) -> AdmissionStats {
        let by_class = CostClass::ALL
            .iter()
            .map(|class| {
                let counters = &self.counters[class.index()];
                (
                    *class,
                    ClassAdmissionStats {
                        admitted: counters.admitted.load(Ordering::Relaxed),
                        delayed: counters.delayed.load(Ordering::Relaxed),
                        rejected: counters.rejected.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        AdmissionStats {
            by_class,
            throttled: self.governor.is_throttled(),
            last_load: self.governor.last_load(),
            active_requesters: self.requester_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClassBudget;

    fn controller_with(config: AdmissionConfig) -> (Arc<ManualClock>, AdmissionController) {
        let clock = ManualClock::shared();
        (clock.clone(), AdmissionController::new(&config, 4, clock))
    }

    fn small_light_budget() -> AdmissionConfig {
        let mut config = AdmissionConfig::default();
        config.budgets.light = ClassBudget::new(10.0, 1.0, Duration::from_millis(100));
        config
    }

    #[test]
    fn test_instant_burst_admits_capacity() {
        let (_clock, controller) = controller_with(small_light_budget());
        let decisions: Vec<_> = (0..15)
            .map(|_| controller.evaluate("alice", CostClass::Light))
            .collect();

        let admitted = decisions
            .iter()
            .filter(|d| **d == AdmissionDecision::Admit)
            .count();
        assert_eq!(admitted, 10);
        assert!(decisions[10..]
            .iter()
            .all(|d| matches!(d, AdmissionDecision::Reject { .. } | AdmissionDecision::Delay(_))));

        let stats = controller.stats();
        assert_eq!(stats.by_class[&CostClass::Light].admitted, 10);
        assert_eq!(stats.by_class[&CostClass::Light].rejected, 5);
    }

    #[test]
    fn test_classes_do_not_starve_each_other() {
        let (_clock, controller) = controller_with(AdmissionConfig::default());
        while controller.evaluate("bob", CostClass::Analytical).is_admitted() {}
        assert_eq!(
            controller.evaluate("bob", CostClass::Light),
            AdmissionDecision::Admit
        );
        assert_eq!(
            controller.evaluate("bob", CostClass::Heavy),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn test_requesters_are_independent() {
        let (_clock, controller) = controller_with(small_light_budget());
        for _ in 0..10 {
            controller.evaluate("alice", CostClass::Light);
        }
        assert!(!controller.evaluate("alice", CostClass::Light).is_admitted());
        assert_eq!(
            controller.evaluate("carol", CostClass::Light),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn test_refill_over_time() {
        let (clock, controller) = controller_with(small_light_budget());
        for _ in 0..10 {
            controller.evaluate("alice", CostClass::Light);
        }
        clock.advance(Duration::from_secs(3));
        let admitted = (0..10)
            .filter(|_| controller.evaluate("alice", CostClass::Light).is_admitted())
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_requester_override() {
        let mut config = small_light_budget();
        let mut vip = config.budgets;
        vip.light = ClassBudget::new(50.0, 10.0, Duration::ZERO);
        config.requester_overrides.insert("vip".into(), vip);
        let (_clock, controller) = controller_with(config);

        let admitted = (0..60)
            .filter(|_| controller.evaluate("vip", CostClass::Light).is_admitted())
            .count();
        assert_eq!(admitted, 50);
        assert_eq!(controller.available_tokens("vip", CostClass::Light), Some(0.0));
    }

    #[test]
    fn test_load_hysteresis() {
        let (clock, controller) = controller_with(small_light_budget());
        for _ in 0..10 {
            controller.evaluate("alice", CostClass::Light);
        }

        controller.observe_load(0.9);
        assert!(controller.is_throttled());
        controller.observe_load(0.7);
        assert!(controller.is_throttled(), "stays throttled between the marks");

        clock.advance(Duration::from_secs(4));
        let tokens = controller.available_tokens("alice", CostClass::Light).unwrap();
        assert!((tokens - 2.0).abs() < 1e-9);

        controller.observe_load(0.5);
        assert!(!controller.is_throttled());
        let tokens = controller.available_tokens("alice", CostClass::Light).unwrap();
        assert!((tokens - 4.0).abs() < 1e-9);
        assert_eq!(controller.stats().last_load, 0.5);
    }

    #[test]
    fn test_idle_budgets_are_evicted() {
        let mut config = AdmissionConfig::default();
        config.idle_timeout = Duration::from_secs(60);
        let (clock, controller) = controller_with(config);

        controller.evaluate("old", CostClass::Light);
        clock.advance(Duration::from_secs(45));
        controller.evaluate("recent", CostClass::Light);
        clock.advance(Duration::from_secs(30));

        assert_eq!(controller.evict_idle(), 1);
        assert_eq!(controller.requester_count(), 1);
        assert!(controller.available_tokens("old", CostClass::Light).is_none());
    }
}
