// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine configuration
//!
//! Configuration is nested per component and can be built three ways:
//! from `Default` (or a preset), from a JSON document, or from a flat set of
//! named options such as `light_bucket_capacity=100`. All three paths end in
//! [`EngineConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::classify::classifier::CostClass;
use crate::classify::features::FEATURE_COUNT;
use crate::classify::limits::QueryLimits;
use crate::error::{EngineError, EngineResult};

/// Where admission sits relative to the response-cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionOrder {
    /// Every request pays tokens, cached or not
    BeforeCache,
    /// A response-cache hit is served without consuming tokens
    AfterCacheHit,
}

impl Default for AdmissionOrder {
    fn default() -> Self {
        AdmissionOrder::BeforeCache
    }
}

/// Token bucket parameters for one cost class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassBudget {
    /// Burst ceiling
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Longest wait handed out as `Delay`; anything longer is `Reject`
    pub max_delay: Duration,
}

impl ClassBudget {
    pub fn new(capacity: f64, refill_rate: f64, max_delay: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            max_delay,
        }
    }

    fn validate(&self, class: CostClass) -> EngineResult<()> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(EngineError::invalid_config(format!(
                "{} bucket capacity must be at least 1, got {}",
                class, self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(EngineError::invalid_config(format!(
                "{} refill rate must be a non-negative number, got {}",
                class, self.refill_rate
            )));
        }
        Ok(())
    }
}

/// One budget per cost class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassBudgets {
    pub light: ClassBudget,
    pub standard: ClassBudget,
    pub heavy: ClassBudget,
    pub analytical: ClassBudget,
}

impl ClassBudgets {
    pub fn get(&self, class: CostClass) -> &ClassBudget {
        match class {
            CostClass::Light => &self.light,
            CostClass::Standard => &self.standard,
            CostClass::Heavy => &self.heavy,
            CostClass::Analytical => &self.analytical,
        }
    }

    pub fn get_mut(&mut self, class: CostClass) -> &mut ClassBudget {
        match class {
            CostClass::Light => &mut self.light,
            CostClass::Standard => &mut self.standard,
            CostClass::Heavy => &mut self.heavy,
            CostClass::Analytical => &mut self.analytical,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        for class in CostClass::ALL {
            self.get(class).validate(class)?;
        }
        Ok(())
    }
}

impl Default for ClassBudgets {
    fn default() -> Self {
        Self {
            light: ClassBudget::new(100.0, 50.0, Duration::from_millis(100)),
            standard: ClassBudget::new(50.0, 20.0, Duration::from_millis(250)),
            heavy: ClassBudget::new(10.0, 2.0, Duration::from_secs(1)),
            analytical: ClassBudget::new(2.0, 0.1, Duration::from_secs(2)),
        }
    }
}

/// Load-based throttling with hysteresis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadGovernorConfig {
    /// Throttling engages when the load gauge rises above this
    pub high_water: f64,
    /// Throttling disengages when the load gauge falls below this
    pub low_water: f64,
    /// Multiplier applied to every refill rate while throttled
    pub throttle_factor: f64,
}

impl Default for LoadGovernorConfig {
    fn default() -> Self {
        Self {
            high_water: 0.85,
            low_water: 0.60,
            throttle_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub order: AdmissionOrder,
    pub budgets: ClassBudgets,
    pub load: LoadGovernorConfig,
    /// Budgets untouched for this long are dropped by maintenance
    pub idle_timeout: Duration,
    /// Per-requester budgets replacing `budgets`
    pub requester_overrides: HashMap<String, ClassBudgets>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            order: AdmissionOrder::default(),
            budgets: ClassBudgets::default(),
            load: LoadGovernorConfig::default(),
            idle_timeout: Duration::from_secs(600),
            requester_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Depth, fields, arguments, fragments, list fields, joins
    pub weights: [f64; FEATURE_COUNT],
    /// Upper bounds (exclusive) of Light, Standard and Heavy
    pub thresholds: [f64; 3],
    /// Query shapes remembered by the historical cost table
    pub history_capacity: usize,
    /// EMA factor for new observations
    pub history_smoothing: f64,
    /// Share of the blended score taken from history
    pub history_weight: f64,
    pub limits: QueryLimits,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            weights: [4.0, 1.0, 2.0, 3.0, 15.0, 25.0],
            thresholds: [50.0, 250.0, 1000.0],
            history_capacity: 4096,
            history_smoothing: 0.2,
            history_weight: 0.3,
            limits: QueryLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub base_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// More invalidations than this inside the stats window pin a key to `min_ttl`
    pub pin_threshold: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(60),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(300),
            pin_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessStatsConfig {
    /// Keys tracked before least-recently-touched stats are dropped
    pub capacity: usize,
    /// Frequency and volatility halve over this period
    pub half_life: Duration,
    /// Rolling window for counting recent invalidations
    pub invalidation_window: Duration,
}

impl Default for AccessStatsConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            half_life: Duration::from_secs(60),
            invalidation_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    pub capacity: usize,
    /// Fragments larger than this are never cached
    pub max_entry_bytes: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_entry_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// How long an invalidation keeps blocking older in-flight stores
    pub tombstone_retention: Duration,
    pub max_tombstones: usize,
    /// Recent events kept for inspection
    pub history_size: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::from_secs(300),
            max_tombstones: 10_000,
            history_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Successful probes needed to close it again
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock shards per concurrent table
    pub shards: usize,
    pub classifier: ClassifierConfig,
    pub admission: AdmissionConfig,
    pub ttl: TtlConfig,
    pub access_stats: AccessStatsConfig,
    pub plan_cache: PlanCacheConfig,
    pub response_cache: ResponseCacheConfig,
    pub invalidation: InvalidationConfig,
    pub breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            classifier: ClassifierConfig::default(),
            admission: AdmissionConfig::default(),
            ttl: TtlConfig::default(),
            access_stats: AccessStatsConfig::default(),
            plan_cache: PlanCacheConfig::default(),
            response_cache: ResponseCacheConfig::default(),
            invalidation: InvalidationConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Larger caches and longer lifetimes for read-heavy traffic
    pub fn read_optimized() -> Self {
        let mut config = Self::default();
        config.plan_cache.capacity = 5_000;
        config.response_cache.capacity = 50_000;
        config.ttl.base_ttl = Duration::from_secs(120);
        config.ttl.max_ttl = Duration::from_secs(900);
        config.admission.order = AdmissionOrder::AfterCacheHit;
        config
    }

    /// Small tables for constrained hosts
    pub fn memory_constrained() -> Self {
        let mut config = Self::default();
        config.shards = 4;
        config.plan_cache.capacity = 200;
        config.response_cache.capacity = 1_000;
        config.response_cache.max_entry_bytes = 64 * 1024;
        config.access_stats.capacity = 5_000;
        config.classifier.history_capacity = 512;
        config.invalidation.max_tombstones = 1_000;
        config.invalidation.history_size = 100;
        config
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| EngineError::invalid_config(format!("malformed JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from flat `name = value` options on top of the defaults
    pub fn from_options<I, K, V>(options: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.set_option(name.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one flat option by name
    ///
    /// Durations are given in milliseconds (`*_ms`). Does not validate the
    /// configuration as a whole; call [`EngineConfig::validate`] afterwards.
    pub fn set_option(&mut self, name: &str, value: &str) -> EngineResult<()> {
        let name = name.trim();
        let value = value.trim();

        if let Some((class, option)) = split_class_option(name) {
            let budget = self.admission.budgets.get_mut(class);
            return match option {
                "bucket_capacity" => {
                    budget.capacity = parse(name, value)?;
                    Ok(())
                }
                "refill_rate" => {
                    budget.refill_rate = parse(name, value)?;
                    Ok(())
                }
                "max_delay_ms" => {
                    budget.max_delay = parse_millis(name, value)?;
                    Ok(())
                }
                _ => Err(unknown_option(name)),
            };
        }

        match name {
            "shards" => self.shards = parse(name, value)?,

            "classifier_weights" => self.classifier.weights = parse_list(name, value)?,
            "classifier_thresholds" => self.classifier.thresholds = parse_list(name, value)?,
            "history_capacity" => self.classifier.history_capacity = parse(name, value)?,
            "history_smoothing" => self.classifier.history_smoothing = parse(name, value)?,
            "history_weight" => self.classifier.history_weight = parse(name, value)?,
            "max_query_depth" => self.classifier.limits.max_depth = parse_optional(name, value)?,
            "max_cost_score" => {
                self.classifier.limits.max_cost_score = parse_optional(name, value)?
            }
            "exempt_introspection" => {
                self.classifier.limits.exempt_introspection = parse(name, value)?
            }

            "admission_order" => {
                self.admission.order = match value {
                    "before_cache" => AdmissionOrder::BeforeCache,
                    "after_cache_hit" => AdmissionOrder::AfterCacheHit,
                    _ => return Err(bad_value(name, value)),
                }
            }
            "load_high_water" => self.admission.load.high_water = parse(name, value)?,
            "load_low_water" => self.admission.load.low_water = parse(name, value)?,
            "load_throttle_factor" => self.admission.load.throttle_factor = parse(name, value)?,
            "idle_budget_timeout_ms" => self.admission.idle_timeout = parse_millis(name, value)?,

            "base_ttl_ms" => self.ttl.base_ttl = parse_millis(name, value)?,
            "min_ttl_ms" => self.ttl.min_ttl = parse_millis(name, value)?,
            "max_ttl_ms" => self.ttl.max_ttl = parse_millis(name, value)?,
            "ttl_pin_threshold" => self.ttl.pin_threshold = parse(name, value)?,

            "stats_capacity" => self.access_stats.capacity = parse(name, value)?,
            "stats_half_life_ms" => self.access_stats.half_life = parse_millis(name, value)?,
            "invalidation_window_ms" => {
                self.access_stats.invalidation_window = parse_millis(name, value)?
            }

            "in_process_cache_capacity" => self.response_cache.capacity = parse(name, value)?,
            "max_response_bytes" => self.response_cache.max_entry_bytes = parse(name, value)?,
            "plan_cache_capacity" => self.plan_cache.capacity = parse(name, value)?,
            "plan_ttl_ms" => self.plan_cache.ttl = parse_millis(name, value)?,

            "tombstone_retention_ms" => {
                self.invalidation.tombstone_retention = parse_millis(name, value)?
            }
            "max_tombstones" => self.invalidation.max_tombstones = parse(name, value)?,
            "invalidation_history_size" => self.invalidation.history_size = parse(name, value)?,

            "breaker_failure_threshold" => self.breaker.failure_threshold = parse(name, value)?,
            "breaker_success_threshold" => self.breaker.success_threshold = parse(name, value)?,
            "breaker_open_timeout_ms" => self.breaker.open_timeout = parse_millis(name, value)?,

            _ => return Err(unknown_option(name)),
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.shards == 0 {
            return Err(EngineError::invalid_config("shards must be > 0"));
        }

        let classifier = &self.classifier;
        if classifier
            .weights
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(EngineError::invalid_config(
                "classifier weights must be non-negative numbers",
            ));
        }
        let [t0, t1, t2] = classifier.thresholds;
        if !(t0.is_finite() && t1.is_finite() && t2.is_finite() && t0 < t1 && t1 < t2) {
            return Err(EngineError::invalid_config(format!(
                "classifier thresholds must be strictly increasing, got {:?}",
                classifier.thresholds
            )));
        }
        if classifier.history_capacity == 0 {
            return Err(EngineError::invalid_config("history_capacity must be > 0"));
        }
        for (label, value) in [
            ("history_smoothing", classifier.history_smoothing),
            ("history_weight", classifier.history_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::invalid_config(format!(
                    "{} must be within [0, 1], got {}",
                    label, value
                )));
            }
        }

        self.admission.budgets.validate()?;
        for (requester, budgets) in &self.admission.requester_overrides {
            budgets.validate().map_err(|e| {
                EngineError::invalid_config(format!("override for '{}': {}", requester, e))
            })?;
        }
        let load = &self.admission.load;
        if !(load.low_water < load.high_water) {
            return Err(EngineError::invalid_config(format!(
                "load low water ({}) must be below high water ({})",
                load.low_water, load.high_water
            )));
        }
        if !(load.throttle_factor > 0.0 && load.throttle_factor <= 1.0) {
            return Err(EngineError::invalid_config(
                "load throttle factor must be within (0, 1]",
            ));
        }

        let ttl = &self.ttl;
        if ttl.min_ttl.is_zero() {
            return Err(EngineError::invalid_config("min_ttl must be > 0"));
        }
        if !(ttl.min_ttl <= ttl.base_ttl && ttl.base_ttl <= ttl.max_ttl) {
            return Err(EngineError::invalid_config(format!(
                "expected min_ttl <= base_ttl <= max_ttl, got {:?} / {:?} / {:?}",
                ttl.min_ttl, ttl.base_ttl, ttl.max_ttl
            )));
        }

        if self.access_stats.capacity == 0 {
            return Err(EngineError::invalid_config("stats capacity must be > 0"));
        }
        if self.access_stats.half_life.is_zero() || self.access_stats.invalidation_window.is_zero()
        {
            return Err(EngineError::invalid_config(
                "stats half-life and invalidation window must be > 0",
            ));
        }

        if self.plan_cache.capacity == 0 || self.response_cache.capacity == 0 {
            return Err(EngineError::invalid_config(
                "cache capacities must be > 0",
            ));
        }
        if self.plan_cache.ttl.is_zero() {
            return Err(EngineError::invalid_config("plan ttl must be > 0"));
        }

        if self.invalidation.tombstone_retention.is_zero()
            || self.invalidation.max_tombstones == 0
        {
            return Err(EngineError::invalid_config(
                "tombstone retention and max_tombstones must be > 0",
            ));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(EngineError::invalid_config(
                "breaker thresholds must be > 0",
            ));
        }

        Ok(())
    }
}

/// `light_bucket_capacity` -> (Light, "bucket_capacity")
fn split_class_option(name: &str) -> Option<(CostClass, &str)> {
    CostClass::ALL.iter().find_map(|class| {
        name.strip_prefix(class.name())
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|option| (*class, option))
    })
}

fn parse<T: FromStr>(name: &str, value: &str) -> EngineResult<T> {
    value.parse().map_err(|_| bad_value(name, value))
}

fn parse_millis(name: &str, value: &str) -> EngineResult<Duration> {
    parse::<u64>(name, value).map(Duration::from_millis)
}

/// `none` (or an empty value) clears the option
fn parse_optional<T: FromStr>(name: &str, value: &str) -> EngineResult<Option<T>> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse(name, value).map(Some)
    }
}

fn parse_list<const N: usize>(name: &str, value: &str) -> EngineResult<[f64; N]> {
    let parsed = value
        .split(',')
        .map(|part| parse::<f64>(name, part.trim()))
        .collect::<EngineResult<Vec<f64>>>()?;
    <[f64; N]>::try_from(parsed).map_err(|values| {
        EngineError::invalid_config(format!(
            "option '{}' expects {} comma separated values, got {}",
            name,
            N,
            values.len()
        ))
    })
}

fn unknown_option(name: &str) -> EngineError {
    EngineError::invalid_config(format!("unknown option '{}'", name))
}

fn bad_value(name: &str, value: &str) -> EngineError {
    EngineError::invalid_config(format!("invalid value '{}' for option '{}'", value, name))
}
