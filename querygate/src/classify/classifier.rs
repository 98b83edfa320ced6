// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cost classification
//!
//! The classifier is a weighted linear model over the feature vector with
//! fixed class thresholds. Weights and thresholds come from configuration.
//! Anything implementing [`CostClassifier`] can replace it (for example a
//! learned model) without touching the engine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::features::{FeatureVector, FEATURE_COUNT};
use crate::cache::lru::LruMap;
use crate::config::ClassifierConfig;
use crate::query::QueryHash;

/// Expected resource consumption, cheapest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum CostClass {
    Light,
    Standard,
    Heavy,
    Analytical,
}

impl CostClass {
    pub const ALL: [CostClass; 4] = [
        CostClass::Light,
        CostClass::Standard,
        CostClass::Heavy,
        CostClass::Analytical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CostClass::Light => "light",
            CostClass::Standard => "standard",
            CostClass::Heavy => "heavy",
            CostClass::Analytical => "analytical",
        }
    }
}

impl fmt::Display for CostClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output of a classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: CostClass,
    pub score: f64,
}

/// Maps a feature vector to a cost class
///
/// Implementations must be pure: the same vector always yields the same
/// class and score.
pub trait CostClassifier: Send + Sync {
    fn classify(&self, features: &FeatureVector) -> Classification;

    /// Class for a score produced outside `classify` (e.g. blended with history)
    fn class_for_score(&self, score: f64) -> CostClass;
}

/// Weighted linear scoring with fixed thresholds
#[derive(Debug, Clone)]
pub struct LinearCostClassifier {
    weights: [f64; FEATURE_COUNT],
    thresholds: [f64; 3],
}

impl LinearCostClassifier {
    pub fn new(weights: [f64; FEATURE_COUNT], thresholds: [f64; 3]) -> Self {
        Self {
            weights,
            thresholds,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.weights, config.thresholds)
    }

    pub fn score(&self, features: &FeatureVector) -> f64 {
        features
            .values()
            .iter()
            .zip(self.weights.iter())
            .map(|(value, weight)| value * weight)
            .sum()
    }
}

impl Default for LinearCostClassifier {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl CostClassifier for LinearCostClassifier {
    fn classify(&self, features: &FeatureVector) -> Classification {
        let score = self.score(features);
        Classification {
            class: self.class_for_score(score),
            score,
        }
    }

    fn class_for_score(&self, score: f64) -> CostClass {
        if !score.is_finite() || score < self.thresholds[0] {
            CostClass::Light
        } else if score < self.thresholds[1] {
            CostClass::Standard
        } else if score < self.thresholds[2] {
            CostClass::Heavy
        } else {
            CostClass::Analytical
        }
    }
}

/// Observed cost of one query shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalCost {
    pub average: f64,
    pub samples: u64,
}

/// Rolling, bounded table of observed costs per query shape
///
/// Observed costs are expressed in score units by the caller. The average is
/// an exponential moving average so recent executions dominate.
pub struct CostHistory {
    shards: Vec<Mutex<LruMap<QueryHash, HistoricalCost>>>,
    smoothing: f64,
    weight: f64,
}

impl CostHistory {
    pub fn new(capacity: usize, shard_count: usize, smoothing: f64, weight: f64) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (capacity / shard_count).max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruMap::new(per_shard)))
                .collect(),
            smoothing: smoothing.clamp(0.0, 1.0),
            weight: weight.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ClassifierConfig, shard_count: usize) -> Self {
        Self::new(
            config.history_capacity,
            shard_count,
            config.history_smoothing,
            config.history_weight,
        )
    }

    fn shard(&self, hash: QueryHash) -> &Mutex<LruMap<QueryHash, HistoricalCost>> {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn record(&self, hash: QueryHash, observed_cost: f64) {
        if !observed_cost.is_finite() || observed_cost < 0.0 {
            log::debug!("Ignoring invalid observed cost {} for {}", observed_cost, hash);
            return;
        }

        let mut shard = self.shard(hash).lock();
        match shard.get_mut(&hash) {
            Some(entry) => {
                entry.average =
                    entry.average * (1.0 - self.smoothing) + observed_cost * self.smoothing;
                entry.samples += 1;
            }
            None => {
                shard.insert(
                    hash,
                    HistoricalCost {
                        average: observed_cost,
                        samples: 1,
                    },
                );
            }
        }
    }

    pub fn get(&self, hash: QueryHash) -> Option<HistoricalCost> {
        self.shard(hash).lock().peek(&hash).copied()
    }

    /// Blend a structural score with the observed history for the shape
    pub fn blend(&self, hash: QueryHash, structural_score: f64) -> f64 {
        match self.get(hash) {
            Some(history) => {
                structural_score * (1.0 - self.weight) + history.average * self.weight
            }
            None => structural_score,
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
