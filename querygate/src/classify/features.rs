// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Structural feature extraction
//!
//! Walks a [`QueryShape`] once and counts the properties that drive backend
//! cost. Counts are those of the fully expanded query, but each named
//! fragment body is walked once per owning service and its counts are reused
//! at every spread, so the walk stays linear in the size of the shape.
//! A fragment that is already being expanded is skipped so a malformed cycle
//! cannot recurse forever. Counters saturate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::query::{NormalizedQuery, QueryShape, Selection};

/// Number of dimensions in a [`FeatureVector`]
pub const FEATURE_COUNT: usize = 6;

/// Dimension of the feature vector, in storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    Depth = 0,
    Fields = 1,
    Arguments = 2,
    Fragments = 3,
    ListFields = 4,
    Joins = 5,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Depth,
        Feature::Fields,
        Feature::Arguments,
        Feature::Fragments,
        Feature::ListFields,
        Feature::Joins,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::Depth => "depth",
            Feature::Fields => "fields",
            Feature::Arguments => "args",
            Feature::Fragments => "fragments",
            Feature::ListFields => "lists",
            Feature::Joins => "joins",
        }
    }
}

/// Raw structural counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCounts {
    pub depth: u32,
    pub fields: u32,
    pub args: u32,
    pub fragments: u32,
    pub lists: u32,
    pub joins: u32,
}

/// Fixed-length, non-negative feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    /// Build from raw values; negative or non-finite values become zero
    pub fn from_values(values: [f64; FEATURE_COUNT]) -> Self {
        let mut clean = values;
        for value in clean.iter_mut() {
            if !value.is_finite() || *value < 0.0 {
                *value = 0.0;
            }
        }
        Self(clean)
    }

    pub fn zero() -> Self {
        Self([0.0; FEATURE_COUNT])
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature.index()]
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }

    pub fn depth(&self) -> u32 {
        self.get(Feature::Depth) as u32
    }
}

impl From<FeatureCounts> for FeatureVector {
    fn from(counts: FeatureCounts) -> Self {
        Self([
            counts.depth as f64,
            counts.fields as f64,
            counts.args as f64,
            counts.fragments as f64,
            counts.lists as f64,
            counts.joins as f64,
        ])
    }
}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, feature) in Feature::ALL.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", feature.name(), self.0[i])?;
        }
        write!(f, "}}")
    }
}

/// Stateless extractor; cheap to share between threads
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, query: &NormalizedQuery) -> FeatureVector {
        self.count(query.shape()).into()
    }

    /// Count structural properties of a shape
    pub fn count(&self, shape: &QueryShape) -> FeatureCounts {
        let mut walk = Walk {
            shape,
            summaries: HashMap::new(),
            expanding: Vec::new(),
        };
        walk.selections(&shape.selections, None)
    }
}

impl FeatureCounts {
    /// Fold in counts measured `base` levels below this selection set
    fn absorb(&mut self, inner: &FeatureCounts, base: u32) {
        self.fields = self.fields.saturating_add(inner.fields);
        self.args = self.args.saturating_add(inner.args);
        self.fragments = self.fragments.saturating_add(inner.fragments);
        self.lists = self.lists.saturating_add(inner.lists);
        self.joins = self.joins.saturating_add(inner.joins);
        if inner.depth > 0 {
            self.depth = self.depth.max(base.saturating_add(inner.depth));
        }
    }
}

struct Walk<'a> {
    shape: &'a QueryShape,
    /// Expanded counts per named fragment and owning service
    summaries: HashMap<(&'a str, Option<&'a str>), FeatureCounts>,
    expanding: Vec<&'a str>,
}

impl<'a> Walk<'a> {
    /// Counts for a selection set, with depth relative to it (its own fields at 1)
    fn selections(
        &mut self,
        selections: &'a [Selection],
        owner: Option<&'a str>,
    ) -> FeatureCounts {
        let mut counts = FeatureCounts::default();
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    counts.fields = counts.fields.saturating_add(1);
                    counts.args = counts.args.saturating_add(field.argument_count);
                    counts.depth = counts.depth.max(1);
                    if field.is_list {
                        counts.lists = counts.lists.saturating_add(1);
                    }

                    let field_owner = field.service.as_deref().or(owner);
                    if let (Some(parent), Some(own)) = (owner, field.service.as_deref()) {
                        if parent != own {
                            counts.joins = counts.joins.saturating_add(1);
                        }
                    }

                    let nested = self.selections(&field.selections, field_owner);
                    counts.absorb(&nested, 1);
                }
                Selection::InlineFragment { selections, .. } => {
                    counts.fragments = counts.fragments.saturating_add(1);
                    let inner = self.selections(selections, owner);
                    counts.absorb(&inner, 0);
                }
                Selection::FragmentSpread(name) => {
                    counts.fragments = counts.fragments.saturating_add(1);
                    if self.expanding.iter().any(|n| *n == name.as_str()) {
                        continue;
                    }
                    match self.fragment(name.as_str(), owner) {
                        Some(inner) => counts.absorb(&inner, 0),
                        None => {
                            // Unresolved spread: assume one field in its place
                            counts.fields = counts.fields.saturating_add(1);
                            counts.depth = counts.depth.max(1);
                        }
                    }
                }
            }
        }
        counts
    }

    /// Expand a named fragment once per owner; later spreads reuse the result
    fn fragment(&mut self, name: &'a str, owner: Option<&'a str>) -> Option<FeatureCounts> {
        if let Some(counts) = self.summaries.get(&(name, owner)) {
            return Some(*counts);
        }
        let body = self.shape.fragments.get(name)?;
        self.expanding.push(name);
        let counts = self.selections(body, owner);
        self.expanding.pop();
        self.summaries.insert((name, owner), counts);
        Some(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FieldNode, QueryShape};

    fn extract(shape: QueryShape) -> FeatureCounts {
        FeatureExtractor::new().count(&shape)
    }

    #[test]
    fn test_nested_counts() {
        // offer -> reviews -> author = depth 3
        let shape = QueryShape::query().select(
            FieldNode::new("offer")
                .with_args(1)
                .owned_by("offers")
                .select(FieldNode::new("id"))
                .select(
                    FieldNode::new("reviews")
                        .list()
                        .owned_by("ugc")
                        .select(FieldNode::new("author").owned_by("users")),
                ),
        );

        let counts = extract(shape);
        assert_eq!(counts.depth, 3);
        assert_eq!(counts.fields, 4);
        assert_eq!(counts.args, 1);
        assert_eq!(counts.lists, 1);
        // offers -> ugc, ugc -> users
        assert_eq!(counts.joins, 2);
    }

    #[test]
    fn test_fragments_expand_without_adding_depth() {
        let shape = QueryShape::query()
            .define_fragment("OfferFields", vec![FieldNode::new("title").into()])
            .select(
                FieldNode::new("offer")
                    .select(Selection::FragmentSpread("OfferFields".into()))
                    .select(Selection::InlineFragment {
                        type_condition: Some("Offer".into()),
                        selections: vec![FieldNode::new("price").into()],
                    }),
            );

        let counts = extract(shape);
        assert_eq!(counts.fragments, 2);
        assert_eq!(counts.fields, 3);
        assert_eq!(counts.depth, 2);
    }

    #[test]
    fn test_cyclic_fragment_terminates() {
        let shape = QueryShape::query()
            .define_fragment(
                "Loop",
                vec![
                    FieldNode::new("id").into(),
                    Selection::FragmentSpread("Loop".into()),
                ],
            )
            .select(FieldNode::new("user").select(Selection::FragmentSpread("Loop".into())));

        let counts = extract(shape);
        assert_eq!(counts.fragments, 2);
        assert_eq!(counts.fields, 2);
    }

    #[test]
    fn test_unresolved_spread_counts_one_level() {
        let shape = QueryShape::query()
            .select(FieldNode::new("user").select(Selection::FragmentSpread("Missing".into())));
        let counts = extract(shape);
        assert_eq!(counts.depth, 2);
        assert_eq!(counts.fields, 2);
    }

    /// Root field spreading F0; each F{i} spreads F{i+1} twice; the last holds one field
    fn doubling_chain(levels: usize) -> QueryShape {
        let mut shape = QueryShape::query();
        for i in 0..levels {
            let body = if i + 1 == levels {
                vec![FieldNode::new("leaf").into()]
            } else {
                let next = format!("F{}", i + 1);
                vec![
                    Selection::FragmentSpread(next.clone()),
                    Selection::FragmentSpread(next),
                ]
            };
            shape = shape.define_fragment(format!("F{}", i), body);
        }
        shape.select(FieldNode::new("root").select(Selection::FragmentSpread("F0".into())))
    }

    #[test]
    fn test_repeated_spreads_count_expanded_size() {
        let counts = extract(doubling_chain(10));
        assert_eq!(counts.fields, 1 + (1 << 9));
        assert_eq!(counts.fragments, (1 << 10) - 1);
        assert_eq!(counts.depth, 2);
    }

    #[test]
    fn test_deep_doubling_chain_saturates_quickly() {
        let started = std::time::Instant::now();
        let counts = extract(doubling_chain(48));
        assert_eq!(counts.fields, u32::MAX);
        assert_eq!(counts.fragments, u32::MAX);
        assert_eq!(counts.depth, 2);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_fragment_joins_depend_on_spread_owner() {
        let shape = QueryShape::query()
            .define_fragment(
                "Author",
                vec![FieldNode::new("author").owned_by("users").into()],
            )
            .select(
                FieldNode::new("offer")
                    .owned_by("offers")
                    .select(Selection::FragmentSpread("Author".into())),
            )
            .select(
                FieldNode::new("profile")
                    .owned_by("users")
                    .select(Selection::FragmentSpread("Author".into())),
            );

        let counts = extract(shape);
        // Only the spread under `offers` crosses a service boundary
        assert_eq!(counts.joins, 1);
        assert_eq!(counts.fields, 4);
    }

    #[test]
    fn test_vector_sanitizes_values() {
        let fv = FeatureVector::from_values([-1.0, f64::NAN, 2.0, 0.0, f64::INFINITY, 1.0]);
        assert_eq!(fv.values(), &[0.0, 0.0, 2.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            fv.to_string(),
            "{depth:0, fields:0, args:2, fragments:0, lists:0, joins:1}"
        );
    }
}
