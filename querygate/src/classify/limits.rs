// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Depth and complexity guard
//!
//! Applied after classification. A query over either limit is refused
//! outright instead of being rate limited. Introspection queries are exempt
//! by default so schema tooling keeps working.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::features::FeatureVector;
use crate::query::NormalizedQuery;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    pub max_depth: Option<u32>,
    pub max_cost_score: Option<f64>,
    pub exempt_introspection: bool,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_depth: Some(10),
            max_cost_score: None,
            exempt_introspection: true,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LimitViolation {
    #[error("Query depth {depth} exceeds maximum {limit}")]
    TooDeep { depth: u32, limit: u32 },

    #[error("Query cost score {score} exceeds maximum {limit}")]
    TooComplex { score: f64, limit: f64 },
}

impl QueryLimits {
    pub fn unlimited() -> Self {
        Self {
            max_depth: None,
            max_cost_score: None,
            exempt_introspection: true,
        }
    }

    pub fn check(
        &self,
        query: &NormalizedQuery,
        features: &FeatureVector,
        score: f64,
    ) -> Result<(), LimitViolation> {
        if self.exempt_introspection && query.is_introspection() {
            return Ok(());
        }

        if let Some(limit) = self.max_depth {
            let depth = features.depth();
            if depth > limit {
                return Err(LimitViolation::TooDeep { depth, limit });
            }
        }

        if let Some(limit) = self.max_cost_score {
            if score > limit {
                return Err(LimitViolation::TooComplex { score, limit });
            }
        }

        Ok(())
    }
}
