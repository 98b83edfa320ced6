//! Engine fixture driven by a manual clock
//!
//! Uses only the public crate API.

use querygate::{
    BackingStore, Engine, EngineConfig, FieldNode, ManualClock, NormalizedQuery, RequestContext,
};
use std::sync::Arc;
use std::time::Duration;

pub struct EngineFixture {
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
}

impl EngineFixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        super::init_logging();
        let clock = ManualClock::shared();
        let engine = Engine::builder(config)
            .clock(clock.clone())
            .build()
            .expect("Failed to build engine");
        Self { clock, engine }
    }

    /// Engine sharing `clock` and `backing` with other fixtures
    pub fn with_backing(
        config: EngineConfig,
        clock: Arc<ManualClock>,
        backing: Arc<dyn BackingStore>,
    ) -> Self {
        super::init_logging();
        let engine = Engine::builder(config)
            .clock(clock.clone())
            .backing_store(backing)
            .build()
            .expect("Failed to build engine");
        Self { clock, engine }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// `offer(id) { id title price }`, a Light query
pub fn offer_query() -> NormalizedQuery {
    NormalizedQuery::new(
        querygate::QueryShape::query().select(
            FieldNode::new("offer")
                .with_args(1)
                .select(FieldNode::new("id"))
                .select(FieldNode::new("title"))
                .select(FieldNode::new("price")),
        ),
    )
}

/// Customers with their orders, joined across three services (Standard)
pub fn customer_orders_query() -> NormalizedQuery {
    let order = FieldNode::new("orders")
        .list()
        .with_args(3)
        .owned_by("orders")
        .select(FieldNode::new("total"))
        .select(
            FieldNode::new("items")
                .list()
                .owned_by("catalog")
                .select(FieldNode::new("sku"))
                .select(FieldNode::new("price")),
        );
    NormalizedQuery::new(
        querygate::QueryShape::query().select(
            FieldNode::new("customers")
                .list()
                .with_args(2)
                .owned_by("accounts")
                .select(FieldNode::new("name"))
                .select(order),
        ),
    )
}

/// Chain of `depth` nested list fields
pub fn nested_query(depth: usize) -> NormalizedQuery {
    let mut field = FieldNode::new(format!("level{}", depth)).list();
    for level in (1..depth).rev() {
        field = FieldNode::new(format!("level{}", level)).list().select(field);
    }
    NormalizedQuery::new(querygate::QueryShape::query().select(field))
}

pub fn request(query: NormalizedQuery, requester: &str, args_hash: u64) -> RequestContext {
    RequestContext::new(query, requester, args_hash)
}
