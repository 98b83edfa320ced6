// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! QueryGate - adaptive caching and admission for graph query gateways
//!
//! QueryGate sits between a gateway's request handler and its backend
//! services. For every incoming query it decides whether the request may run
//! now, later, or not at all, and whether a cached plan or response can be
//! served instead.
//!
//! # Features
//!
//! - **Cost classification**: structural features scored into four cost
//!   classes, blended with the observed cost of earlier executions
//! - **Admission control**: per-requester token buckets per class, throttled
//!   under system load with hysteresis
//! - **Two-level caching**: in-process LRU in front of an optional shared
//!   store, for compiled plans and for response fragments
//! - **Adaptive TTLs**: lifetimes derived from access frequency and how often
//!   a key was invalidated early
//! - **Invalidation**: exact, prefix and tag patterns that always win against
//!   a concurrent store
//!
//! # Usage
//!
//! ```ignore
//! use querygate::{Engine, EngineConfig, ExecutionResult, RequestContext};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let ctx = RequestContext::new(query, "tenant-a", args_hash);
//! let decision = engine.evaluate(&ctx);
//! if decision.admitted && decision.response.is_none() {
//!     let output = run_query(&ctx, decision.plan.as_ref());
//!     engine.record_execution_result(&ctx, decision.ticket, ExecutionResult::response(output));
//! }
//! ```

pub mod admission;
pub mod cache;
pub mod classify;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod query;
pub mod stats;
pub mod ttl;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionStats};
pub use cache::{
    BackingStore, Blob, CacheStats, InMemoryBackingStore, KeyPattern, PutOutcome, StoreTicket,
};
pub use classify::{CostClass, CostClassifier, FeatureExtractor, FeatureVector, LimitViolation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionOrder, EngineConfig};
pub use engine::{
    Decision, Engine, EngineBuilder, EngineStats, ExecutionResult, ExecutionTicket,
    MaintenanceReport, RejectionReason, RequestContext, StoreReport,
};
pub use error::{BackingStoreError, EngineError, EngineResult};
pub use invalidation::{InvalidationEvent, InvalidationReport};
pub use query::{FieldNode, NormalizedQuery, OperationKind, QueryHash, QueryShape, Selection};
pub use stats::AccessStat;
pub use ttl::{AdaptiveTtlPredictor, TtlPredictor};

/// QueryGate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// QueryGate crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
