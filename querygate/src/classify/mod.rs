// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query classification: structural features, cost scoring and limits

pub mod classifier;
pub mod features;
pub mod limits;

pub use classifier::{Classification, CostClass, CostClassifier, CostHistory, LinearCostClassifier};
pub use features::{Feature, FeatureCounts, FeatureExtractor, FeatureVector, FEATURE_COUNT};
pub use limits::{LimitViolation, QueryLimits};
