// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! TTL prediction
//!
//! `ttl = clamp(base * (1 + ln(1 + frequency)) / (1 + volatility), min, max)`
//!
//! Keys without statistics get exactly `base`. Keys invalidated more than
//! `pin_threshold` times inside the stats window are pinned to `min` until
//! the window rolls past those invalidations.

use std::time::Duration;

use crate::config::TtlConfig;
use crate::stats::AccessStat;

/// Recommends a lifetime for a response cache entry
pub trait TtlPredictor: Send + Sync {
    fn predict(&self, key: &str, stat: Option<&AccessStat>) -> Duration;
}

#[derive(Debug, Clone)]
pub struct AdaptiveTtlPredictor {
    config: TtlConfig,
}

impl AdaptiveTtlPredictor {
    pub fn new(config: TtlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TtlConfig {
        &self.config
    }
}

impl Default for AdaptiveTtlPredictor {
    fn default() -> Self {
        Self::new(TtlConfig::default())
    }
}

impl TtlPredictor for AdaptiveTtlPredictor {
    fn predict(&self, key: &str, stat: Option<&AccessStat>) -> Duration {
        let stat = match stat {
            Some(stat) => stat,
            None => return self.config.base_ttl,
        };

        if stat.invalidations_in_window > self.config.pin_threshold {
            log::debug!(
                "{} pinned to min TTL after {} recent invalidations",
                key,
                stat.invalidations_in_window
            );
            return self.config.min_ttl;
        }

        let frequency = stat.windowed_frequency.max(0.0);
        let volatility = stat.volatility_score.max(0.0);
        let seconds = self.config.base_ttl.as_secs_f64() * (1.0 + frequency.ln_1p())
            / (1.0 + volatility);
        if !seconds.is_finite() {
            return self.config.base_ttl;
        }

        let min = self.config.min_ttl.as_secs_f64();
        let max = self.config.max_ttl.as_secs_f64();
        Duration::from_secs_f64(seconds.clamp(min, max))
    }
}
