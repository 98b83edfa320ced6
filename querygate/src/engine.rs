// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine facade
//!
//! The single entry point used by the request-handling layer:
//!
//! 1. [`Engine::evaluate`] classifies the query, applies admission and looks
//!    up cached plan and response
//! 2. on a miss the caller executes the query itself, then hands the result
//!    back through [`Engine::record_execution_result`]
//! 3. the mutation pipeline calls [`Engine::notify`] when backend data
//!    changes
//!
//! Every component locks its own shards; the engine adds no lock of its own
//! and never sleeps. A `Delay` is returned to the caller to honour.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionStats};
use crate::cache::backing::BackingStore;
use crate::cache::multi_level::{PutOutcome, StoreTicket};
use crate::cache::plan_cache::PlanCache;
use crate::cache::response_cache::{ResponseCache, ResponseCacheKey};
use crate::cache::{Blob, CacheKey, CacheStats, KeyPattern};
use crate::classify::classifier::{CostClass, CostClassifier, CostHistory, LinearCostClassifier};
use crate::classify::features::{FeatureExtractor, FeatureVector};
use crate::classify::limits::{LimitViolation, QueryLimits};
use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionOrder, EngineConfig};
use crate::error::EngineResult;
use crate::invalidation::{
    InvalidationEvent, InvalidationRecord, InvalidationReport, InvalidationStats, Invalidator,
};
use crate::query::{NormalizedQuery, OperationKind, QueryHash};
use crate::stats::AccessStatisticsStore;
use crate::ttl::{AdaptiveTtlPredictor, TtlPredictor};

/// One incoming request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub query: NormalizedQuery,
    pub requester: String,
    /// Hash of the argument values stripped from the query
    pub args_hash: u64,
    /// Requester scope for personalized fields; `None` for shared responses
    pub scope: Option<String>,
}

impl RequestContext {
    pub fn new(query: NormalizedQuery, requester: impl Into<String>, args_hash: u64) -> Self {
        Self {
            query,
            requester: requester.into(),
            args_hash,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn response_key(&self) -> ResponseCacheKey {
        ResponseCacheKey::new(self.query.hash(), self.args_hash, self.scope.clone())
    }

    /// Only read operations have cacheable responses
    fn caches_response(&self) -> bool {
        self.query.operation() == OperationKind::Query
    }
}

/// Cache versions observed at evaluation time
///
/// Hand it back with the execution result; stores that an invalidation
/// overtook in the meantime are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTicket {
    pub plan: StoreTicket,
    pub response: StoreTicket,
}

/// Why a request was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The requester's token bucket for the class is empty
    BudgetExhausted,
    /// The query exceeds the configured depth or cost limit
    QueryLimits(LimitViolation),
}

/// Answer to [`Engine::evaluate`]
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Admitted: wait this long before executing. Rejected: retry hint.
    pub retry_after: Option<Duration>,
    pub plan: Option<Blob>,
    pub response: Option<Blob>,
    pub cost_class: CostClass,
    pub cost_score: f64,
    pub features: FeatureVector,
    pub ticket: ExecutionTicket,
    pub rejection: Option<RejectionReason>,
}

impl Decision {
    /// Admitted and the response can be served from cache
    pub fn is_cached_response(&self) -> bool {
        self.admitted && self.response.is_some()
    }
}

/// Output of an execution the engine should learn from
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Plan compiled for this query, if it was not cached
    pub plan: Option<Blob>,
    /// Response fragment produced by the execution
    pub response: Option<Blob>,
    /// Measured cost in score units
    pub observed_cost: Option<f64>,
    /// Entity tags for the response, e.g. `offer:42`
    pub tags: Vec<String>,
}

impl ExecutionResult {
    pub fn response(value: impl Into<Blob>) -> Self {
        Self {
            response: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_plan(mut self, plan: impl Into<Blob>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_cost(mut self, observed_cost: f64) -> Self {
        self.observed_cost = Some(observed_cost);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// What [`Engine::record_execution_result`] stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReport {
    pub plan: Option<PutOutcome>,
    pub response: Option<PutOutcome>,
    pub response_ttl: Option<Duration>,
}

/// Work done by [`Engine::run_maintenance`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub idle_requesters_evicted: usize,
    pub expired_plans: usize,
    pub expired_responses: usize,
    pub tombstones_pruned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub plan_cache: CacheStats,
    pub response_cache: CacheStats,
    pub admission: AdmissionStats,
    pub invalidation: InvalidationStats,
    pub tracked_keys: usize,
    pub cost_history_entries: usize,
}

/// Builder for [`Engine`] with injectable collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    classifier: Option<Arc<dyn CostClassifier>>,
    ttl_predictor: Option<Arc<dyn TtlPredictor>>,
    plan_backing: Option<Arc<dyn BackingStore>>,
    response_backing: Option<Arc<dyn BackingStore>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            classifier: None,
            ttl_predictor: None,
            plan_backing: None,
            response_backing: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the linear classifier, e.g. with a learned model
    pub fn classifier(mut self, classifier: Arc<dyn CostClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn ttl_predictor(mut self, predictor: Arc<dyn TtlPredictor>) -> Self {
        self.ttl_predictor = Some(predictor);
        self
    }

    /// Shared backing layer for both caches
    pub fn backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.plan_backing = Some(backing.clone());
        self.response_backing = Some(backing);
        self
    }

    pub fn plan_backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.plan_backing = Some(backing);
        self
    }

    pub fn response_backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.response_backing = Some(backing);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let config = self.config;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let shards = config.shards;

        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(LinearCostClassifier::from_config(&config.classifier)));
        let ttl_predictor = self
            .ttl_predictor
            .unwrap_or_else(|| Arc::new(AdaptiveTtlPredictor::new(config.ttl)));

        let plans = PlanCache::new(
            &config.plan_cache,
            shards,
            self.plan_backing,
            &config.invalidation,
            config.breaker,
            clock.clone(),
        );
        let responses = Arc::new(ResponseCache::new(
            &config.response_cache,
            shards,
            self.response_backing,
            &config.invalidation,
            config.breaker,
            clock.clone(),
        ));
        let access_stats = Arc::new(AccessStatisticsStore::new(
            &config.access_stats,
            shards,
            clock.clone(),
        ));
        let invalidator = Invalidator::new(
            responses.clone(),
            access_stats.clone(),
            config.invalidation.history_size,
        );

        log::info!(
            "QueryGate engine ready: {} shards, {} plan / {} response entries, admission {:?}",
            shards,
            config.plan_cache.capacity,
            config.response_cache.capacity,
            config.admission.order
        );

        Ok(Engine {
            extractor: FeatureExtractor::new(),
            classifier,
            cost_history: CostHistory::from_config(&config.classifier, shards),
            limits: config.classifier.limits,
            admission: AdmissionController::new(&config.admission, shards, clock),
            plans,
            responses,
            ttl_predictor,
            access_stats,
            invalidator,
            order: config.admission.order,
            config,
        })
    }
}

/// Adaptive caching and admission engine
pub struct Engine {
    config: EngineConfig,
    extractor: FeatureExtractor,
    classifier: Arc<dyn CostClassifier>,
    cost_history: CostHistory,
    limits: QueryLimits,
    admission: AdmissionController,
    plans: PlanCache,
    responses: Arc<ResponseCache>,
    ttl_predictor: Arc<dyn TtlPredictor>,
    access_stats: Arc<AccessStatisticsStore>,
    invalidator: Invalidator,
    order: AdmissionOrder,
}

impl Engine {
    /// Engine with default collaborators and the system clock
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Classify, admit and look up caches for one request
    pub fn evaluate(&self, ctx: &RequestContext) -> Decision {
        let hash = ctx.query.hash();
        let features = self.extractor.extract(&ctx.query);
        let structural = self.classifier.classify(&features);
        let cost_score = self.cost_history.blend(hash, structural.score);
        let cost_class = if cost_score == structural.score {
            structural.class
        } else {
            self.classifier.class_for_score(cost_score)
        };

        // Taken before any lookup so an invalidation racing with execution wins
        let ticket = ExecutionTicket {
            plan: self.plans.ticket(),
            response: self.responses.ticket(),
        };
        let mut decision = Decision {
            admitted: false,
            retry_after: None,
            plan: None,
            response: None,
            cost_class,
            cost_score,
            features,
            ticket,
            rejection: None,
        };

        if let Err(violation) = self.limits.check(&ctx.query, &features, cost_score) {
            log::debug!("Refusing {} from {}: {}", hash, ctx.requester, violation);
            decision.rejection = Some(RejectionReason::QueryLimits(violation));
            return decision;
        }

        let response_key = ctx.caches_response().then(|| ctx.response_key());

        if self.order == AdmissionOrder::AfterCacheHit {
            if let Some(key) = &response_key {
                if let Some(response) = self.lookup_response(key) {
                    decision.admitted = true;
                    decision.response = Some(response);
                    log::debug!("Serving {} from cache ahead of admission", hash);
                    return decision;
                }
            }
            if !self.admit(ctx, &mut decision) {
                return decision;
            }
            decision.plan = self.plans.get(hash);
            return decision;
        }

        if !self.admit(ctx, &mut decision) {
            return decision;
        }
        decision.plan = self.plans.get(hash);
        decision.response = response_key.and_then(|key| self.lookup_response(&key));
        decision
    }

    fn admit(&self, ctx: &RequestContext, decision: &mut Decision) -> bool {
        match self.admission.evaluate(&ctx.requester, decision.cost_class) {
            AdmissionDecision::Admit => {
                decision.admitted = true;
                true
            }
            AdmissionDecision::Delay(wait) => {
                decision.admitted = true;
                decision.retry_after = Some(wait);
                true
            }
            AdmissionDecision::Reject { retry_after } => {
                decision.retry_after = retry_after;
                decision.rejection = Some(RejectionReason::BudgetExhausted);
                false
            }
        }
    }

    fn lookup_response(&self, key: &ResponseCacheKey) -> Option<Blob> {
        self.access_stats.record_access(&key.cache_key());
        self.responses.get(key)
    }

    /// Learn from an execution that followed a cache miss
    ///
    /// Stores the compiled plan and the response (with a predicted TTL) and
    /// feeds the observed cost into the historical cost table. Still valid
    /// if the original requester went away in the meantime.
    pub fn record_execution_result(
        &self,
        ctx: &RequestContext,
        ticket: ExecutionTicket,
        result: ExecutionResult,
    ) -> StoreReport {
        let hash = ctx.query.hash();
        let mut report = StoreReport {
            plan: None,
            response: None,
            response_ttl: None,
        };

        if let Some(cost) = result.observed_cost {
            self.cost_history.record(hash, cost);
        }

        if let Some(plan) = result.plan {
            report.plan = Some(self.plans.insert_with_ticket(hash, plan, ticket.plan));
        }

        if let Some(response) = result.response {
            if !ctx.caches_response() {
                log::debug!("Not caching response of {:?} {}", ctx.query.operation(), hash);
                return report;
            }
            let key = ctx.response_key();
            let rendered = key.cache_key();
            let stat = self.access_stats.get(&rendered);
            let ttl = self.ttl_predictor.predict(&rendered, stat.as_ref());

            let outcome = self
                .responses
                .store(key, response, ttl, ticket.response, &result.tags);
            if outcome.is_stored() {
                self.access_stats.record_store(&rendered, ttl);
            }
            log::debug!("Stored response {} for {:?}: {:?}", rendered, ttl, outcome);
            report.response = Some(outcome);
            report.response_ttl = Some(ttl);
        }

        report
    }

    /// Apply a data-change notification to the response cache
    pub fn notify(&self, event: InvalidationEvent) -> EngineResult<InvalidationReport> {
        self.invalidator.notify(event)
    }

    /// Invalidate cached plans, e.g. `plan:*` after a schema change
    pub fn invalidate_plans(&self, pattern: &str) -> EngineResult<usize> {
        let pattern = KeyPattern::parse(pattern)?;
        let outcome = self.plans.invalidate(&pattern);
        let removed = outcome.affected_keys().len();
        log::info!("Invalidated {} cached plans matching '{}'", removed, pattern);
        Ok(removed)
    }

    /// Preload known-hot plans
    pub fn warm_plans<I>(&self, plans: I) -> usize
    where
        I: IntoIterator<Item = (QueryHash, Blob)>,
    {
        self.plans.warm(plans)
    }

    /// Feed the system-wide load gauge used by admission throttling
    pub fn observe_load(&self, load: f64) {
        self.admission.observe_load(load);
    }

    /// Housekeeping for the host to run on its own schedule
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            idle_requesters_evicted: self.admission.evict_idle(),
            expired_plans: self.plans.purge_expired(),
            expired_responses: self.responses.purge_expired(),
            tombstones_pruned: self.plans.prune_tombstones() + self.responses.prune_tombstones(),
        };
        log::debug!("Maintenance: {:?}", report);
        report
    }

    pub fn recent_invalidations(&self, limit: usize) -> Vec<InvalidationRecord> {
        self.invalidator.recent_events(limit)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            plan_cache: self.plans.stats(),
            response_cache: self.responses.stats(),
            admission: self.admission.stats(),
            invalidation: self.invalidator.stats(),
            tracked_keys: self.access_stats.len(),
            cost_history_entries: self.cost_history.len(),
        }
    }
}
