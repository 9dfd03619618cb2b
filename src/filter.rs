// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Compiles a filter specification into a predicate closure once, at
//! subscription (or read-all) time, rather than re-matching prefixes/
//! regexes per event (§9 "Dynamic filters").

use regex::Regex;

use crate::ids::StreamId;

#[derive(Debug, Clone)]
pub enum PredicateSpec {
    StreamPrefix(String),
    StreamSuffix(String),
    StreamRegex(String),
    EventTypePrefix(String),
    EventTypeSuffix(String),
    EventTypeRegex(String),
}

/// A disjunction of predicates over `stream-id` and `event-type`,
/// evaluated short-circuit (§4.E "Filter").
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub predicates: Vec<PredicateSpec>,
}

impl FilterSpec {
    pub fn stream_prefix(prefix: impl Into<String>) -> Self {
        Self {
            predicates: vec![PredicateSpec::StreamPrefix(prefix.into())],
        }
    }

    pub fn or(mut self, predicate: PredicateSpec) -> Self {
        self.predicates.push(predicate);
        self
    }
}

enum CompiledPredicate {
    StreamPrefix(String),
    StreamSuffix(String),
    StreamRegex(Regex),
    EventTypePrefix(String),
    EventTypeSuffix(String),
    EventTypeRegex(Regex),
}

/// A compiled filter, cheap to evaluate and safe to share across threads
/// via `Arc` (the dispatcher clones it into every catch-up/live task).
pub struct Filter {
    predicates: Vec<CompiledPredicate>,
}

impl Filter {
    pub fn compile(spec: &FilterSpec) -> Result<Self, regex::Error> {
        let mut predicates = Vec::with_capacity(spec.predicates.len());
        for p in &spec.predicates {
            predicates.push(match p {
                PredicateSpec::StreamPrefix(s) => CompiledPredicate::StreamPrefix(s.clone()),
                PredicateSpec::StreamSuffix(s) => CompiledPredicate::StreamSuffix(s.clone()),
                PredicateSpec::StreamRegex(s) => CompiledPredicate::StreamRegex(Regex::new(s)?),
                PredicateSpec::EventTypePrefix(s) => CompiledPredicate::EventTypePrefix(s.clone()),
                PredicateSpec::EventTypeSuffix(s) => CompiledPredicate::EventTypeSuffix(s.clone()),
                PredicateSpec::EventTypeRegex(s) => CompiledPredicate::EventTypeRegex(Regex::new(s)?),
            });
        }
        Ok(Self { predicates })
    }

    /// An always-true filter, used when a subscription requests no
    /// filtering at all.
    pub fn pass_all() -> Self {
        Self { predicates: Vec::new() }
    }

    pub fn matches(&self, stream_id: &StreamId, event_type: &str) -> bool {
        if self.predicates.is_empty() {
            return true;
        }
        let stream = stream_id.as_str();
        self.predicates.iter().any(|p| match p {
            CompiledPredicate::StreamPrefix(prefix) => stream.starts_with(prefix.as_str()),
            CompiledPredicate::StreamSuffix(suffix) => stream.ends_with(suffix.as_str()),
            CompiledPredicate::StreamRegex(re) => re.is_match(stream),
            CompiledPredicate::EventTypePrefix(prefix) => event_type.starts_with(prefix.as_str()),
            CompiledPredicate::EventTypeSuffix(suffix) => event_type.ends_with(suffix.as_str()),
            CompiledPredicate::EventTypeRegex(re) => re.is_match(event_type),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_prefix_matches() {
        let filter = Filter::compile(&FilterSpec::stream_prefix("billing-")).unwrap();
        assert!(filter.matches(&StreamId::new("billing-42").unwrap(), "Anything"));
        assert!(!filter.matches(&StreamId::new("orders-1").unwrap(), "Anything"));
    }

    #[test]
    fn disjunction_short_circuits_on_first_match() {
        let spec = FilterSpec::stream_prefix("billing-").or(PredicateSpec::EventTypePrefix("Order".to_string()));
        let filter = Filter::compile(&spec).unwrap();
        assert!(filter.matches(&StreamId::new("orders-1").unwrap(), "OrderPlaced"));
        assert!(filter.matches(&StreamId::new("billing-1").unwrap(), "Anything"));
        assert!(!filter.matches(&StreamId::new("orders-1").unwrap(), "ShipmentSent"));
    }

    #[test]
    fn pass_all_matches_everything() {
        let filter = Filter::pass_all();
        assert!(filter.matches(&StreamId::new("x").unwrap(), "y"));
    }
}
