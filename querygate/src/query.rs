// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Normalized query representation handed over by the front end
//!
//! The parser/validator runs before the engine. By the time a query reaches
//! us, literal argument values and variable names have been stripped and what
//! remains is the selection structure plus a content hash of it.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Content hash of a normalized query shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryHash(pub u64);

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Kind of operation the query performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// One selected field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldNode {
    pub name: String,
    /// Number of arguments passed (values already stripped)
    pub argument_count: u32,
    /// Field resolves to a list
    pub is_list: bool,
    /// Backend service owning this field; `None` inherits the parent's
    pub service: Option<String>,
    pub selections: Vec<Selection>,
}

impl FieldNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument_count: 0,
            is_list: false,
            service: None,
            selections: Vec::new(),
        }
    }

    pub fn with_args(mut self, count: u32) -> Self {
        self.argument_count = count;
        self
    }

    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    pub fn owned_by(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selections.push(selection.into());
        self
    }
}

/// Entry in a selection set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selection {
    Field(FieldNode),
    InlineFragment {
        type_condition: Option<String>,
        selections: Vec<Selection>,
    },
    FragmentSpread(String),
}

impl From<FieldNode> for Selection {
    fn from(field: FieldNode) -> Self {
        Selection::Field(field)
    }
}

/// Structure of a normalized query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryShape {
    pub operation: OperationKind,
    pub selections: Vec<Selection>,
    /// Named fragment definitions referenced by spreads
    pub fragments: BTreeMap<String, Vec<Selection>>,
}

impl QueryShape {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            selections: Vec::new(),
            fragments: BTreeMap::new(),
        }
    }

    pub fn query() -> Self {
        Self::new(OperationKind::Query)
    }

    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        self.selections.push(selection.into());
        self
    }

    pub fn define_fragment(mut self, name: impl Into<String>, selections: Vec<Selection>) -> Self {
        self.fragments.insert(name.into(), selections);
        self
    }

    /// Whether the top level only touches introspection fields
    pub fn is_introspection(&self) -> bool {
        let mut saw_field = false;
        for selection in &self.selections {
            if let Selection::Field(field) = selection {
                saw_field = true;
                if field.name != "__schema" && field.name != "__type" && field.name != "__typename"
                {
                    return false;
                }
            }
        }
        saw_field
    }
}

/// Immutable, content-addressed query identifier plus its shape
#[derive(Debug, Clone)]
pub struct NormalizedQuery {
    hash: QueryHash,
    shape: Arc<QueryShape>,
    introspection: bool,
}

impl NormalizedQuery {
    /// Hash the shape and wrap it
    pub fn new(shape: QueryShape) -> Self {
        let mut hasher = DefaultHasher::new();
        shape.hash(&mut hasher);
        let hash = QueryHash(hasher.finish());
        Self::from_parts(hash, shape)
    }

    /// Use a hash computed by the front end
    pub fn from_parts(hash: QueryHash, shape: QueryShape) -> Self {
        let introspection = shape.is_introspection();
        Self {
            hash,
            shape: Arc::new(shape),
            introspection,
        }
    }

    pub fn hash(&self) -> QueryHash {
        self.hash
    }

    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn is_introspection(&self) -> bool {
        self.introspection
    }

    pub fn operation(&self) -> OperationKind {
        self.shape.operation
    }
}

impl PartialEq for NormalizedQuery {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for NormalizedQuery {}
