// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Admission control
//!
//! One token bucket per requester per cost class, so a burst in one class
//! never drains another. A shared load governor scales every refill rate
//! down while the gateway is overloaded.

pub mod bucket;
pub mod controller;

pub use bucket::{BucketDecision, TokenBucket};
pub use controller::{AdmissionController, AdmissionDecision, AdmissionStats, ClassAdmissionStats};
