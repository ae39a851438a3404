// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composable query filters.
//!
//! Two boolean filter trees are used across the engine's query surface:
//!
//! - [`DigestFilter`] selects charts by their digest key/value summaries
//!   and row timestamps.
//! - [`ChartFilter`] selects charts by identity, state value and external
//!   identifiers; delta-stream subscriptions use it too.
//!
//! Trees are evaluated in memory over candidate rows; the SQL layer only
//! pushes down what is trivially indexable. Comparison predicates compare
//! numerically when both operands parse as numbers and lexicographically
//! otherwise. An invalid regex in a `matches` predicate evaluates to false
//! (with a warning) instead of failing the whole query.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ident::ChartReference;
use crate::state::State;

/// Compare two digest values: numeric when both parse, lexicographic
/// otherwise.
fn compare_values(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn regex_matches(pattern: &str, input: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(input),
        Err(error) => {
            warn!(pattern, %error, "invalid regex in filter, treating as non-match");
            false
        }
    }
}

/// The digest view of one chart, assembled for filter evaluation.
#[derive(Debug, Clone)]
pub struct ChartDigest {
    /// The chart the digests describe.
    pub reference: ChartReference,
    /// Digest key/value entries.
    pub entries: HashMap<String, String>,
    /// Earliest digest row creation time for the chart.
    pub created: DateTime<Utc>,
    /// Latest digest row update time for the chart.
    pub updated: DateTime<Utc>,
}

/// Boolean filter tree over digest entries and row timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DigestFilter {
    /// All children match.
    And(Vec<DigestFilter>),
    /// Any child matches.
    Or(Vec<DigestFilter>),
    /// The child does not match.
    Not(Box<DigestFilter>),
    /// The digest key exists with exactly this value.
    Eq {
        /// Digest key.
        key: String,
        /// Expected value.
        value: String,
    },
    /// The digest key exists and its value matches the regex.
    Matches {
        /// Digest key.
        key: String,
        /// Regex pattern.
        pattern: String,
    },
    /// The digest value orders strictly below `value`.
    Lt {
        /// Digest key.
        key: String,
        /// Comparison operand.
        value: String,
    },
    /// The digest value orders at or below `value`.
    Le {
        /// Digest key.
        key: String,
        /// Comparison operand.
        value: String,
    },
    /// The digest value orders strictly above `value`.
    Gt {
        /// Digest key.
        key: String,
        /// Comparison operand.
        value: String,
    },
    /// The digest value orders at or above `value`.
    Ge {
        /// Digest key.
        key: String,
        /// Comparison operand.
        value: String,
    },
    /// The chart's digests were first created before this instant.
    CreatedBefore(DateTime<Utc>),
    /// The chart's digests were first created after this instant.
    CreatedAfter(DateTime<Utc>),
    /// The chart's digests were last updated before this instant.
    UpdatedBefore(DateTime<Utc>),
    /// The chart's digests were last updated after this instant.
    UpdatedAfter(DateTime<Utc>),
}

impl DigestFilter {
    /// Evaluate this tree against one chart's digest view.
    pub fn eval(&self, digest: &ChartDigest) -> bool {
        match self {
            DigestFilter::And(children) => children.iter().all(|c| c.eval(digest)),
            DigestFilter::Or(children) => children.iter().any(|c| c.eval(digest)),
            DigestFilter::Not(child) => !child.eval(digest),
            DigestFilter::Eq { key, value } => digest.entries.get(key) == Some(value),
            DigestFilter::Matches { key, pattern } => digest
                .entries
                .get(key)
                .is_some_and(|v| regex_matches(pattern, v)),
            DigestFilter::Lt { key, value } => digest
                .entries
                .get(key)
                .is_some_and(|v| compare_values(v, value).is_lt()),
            DigestFilter::Le { key, value } => digest
                .entries
                .get(key)
                .is_some_and(|v| compare_values(v, value).is_le()),
            DigestFilter::Gt { key, value } => digest
                .entries
                .get(key)
                .is_some_and(|v| compare_values(v, value).is_gt()),
            DigestFilter::Ge { key, value } => digest
                .entries
                .get(key)
                .is_some_and(|v| compare_values(v, value).is_ge()),
            DigestFilter::CreatedBefore(instant) => digest.created < *instant,
            DigestFilter::CreatedAfter(instant) => digest.created > *instant,
            DigestFilter::UpdatedBefore(instant) => digest.updated < *instant,
            DigestFilter::UpdatedAfter(instant) => digest.updated > *instant,
        }
    }
}

/// The identity/state/external-id view of one chart, assembled for filter
/// evaluation.
#[derive(Debug, Clone)]
pub struct ChartFacts {
    /// The chart.
    pub reference: ChartReference,
    /// Current state value (`null` when unknown, e.g. on delta-stream
    /// entries evaluated before the snapshot exists).
    pub state_value: Value,
    /// External identifiers registered for the chart.
    pub external_ids: Vec<(String, String)>,
}

impl ChartFacts {
    /// Facts with identity only.
    pub fn bare(reference: ChartReference) -> Self {
        Self {
            reference,
            state_value: Value::Null,
            external_ids: Vec::new(),
        }
    }
}

/// Boolean filter tree over chart identity, state value and external ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ChartFilter {
    /// All children match.
    And(Vec<ChartFilter>),
    /// Any child matches.
    Or(Vec<ChartFilter>),
    /// The child does not match.
    Not(Box<ChartFilter>),
    /// Machine id matches the regex.
    MachineIdMatches(String),
    /// Chart id matches the regex.
    ChartIdMatches(String),
    /// State value matches the dotted path pattern (see [`State::matches`]).
    StateMatches(String),
    /// An external id with this key exists and its value matches the regex.
    ExternalIdMatches {
        /// External id key.
        key: String,
        /// Regex pattern over the value.
        pattern: String,
    },
}

impl ChartFilter {
    /// Evaluate this tree against one chart's facts.
    pub fn eval(&self, facts: &ChartFacts) -> bool {
        match self {
            ChartFilter::And(children) => children.iter().all(|c| c.eval(facts)),
            ChartFilter::Or(children) => children.iter().any(|c| c.eval(facts)),
            ChartFilter::Not(child) => !child.eval(facts),
            ChartFilter::MachineIdMatches(pattern) => {
                regex_matches(pattern, &facts.reference.machine_id)
            }
            ChartFilter::ChartIdMatches(pattern) => {
                regex_matches(pattern, &facts.reference.chart_id)
            }
            ChartFilter::StateMatches(pattern) => {
                let probe = State::new(facts.state_value.clone(), Value::Null);
                probe.matches(pattern)
            }
            ChartFilter::ExternalIdMatches { key, pattern } => facts
                .external_ids
                .iter()
                .any(|(k, v)| k == key && regex_matches(pattern, v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(entries: &[(&str, &str)]) -> ChartDigest {
        ChartDigest {
            reference: ChartReference::new("order", "1"),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn eq_and_matches() {
        let d = digest(&[("status", "shipped"), ("total", "120.5")]);
        assert!(DigestFilter::Eq {
            key: "status".into(),
            value: "shipped".into()
        }
        .eval(&d));
        assert!(DigestFilter::Matches {
            key: "status".into(),
            pattern: "^ship".into()
        }
        .eval(&d));
        assert!(!DigestFilter::Eq {
            key: "missing".into(),
            value: "x".into()
        }
        .eval(&d));
    }

    #[test]
    fn numeric_comparison_wins_over_lexicographic() {
        let d = digest(&[("total", "9")]);
        // Lexicographically "9" > "100", numerically 9 < 100.
        assert!(DigestFilter::Lt {
            key: "total".into(),
            value: "100".into()
        }
        .eval(&d));
    }

    #[test]
    fn boolean_composition() {
        let d = digest(&[("status", "open"), ("total", "10")]);
        let tree = DigestFilter::And(vec![
            DigestFilter::Eq {
                key: "status".into(),
                value: "open".into(),
            },
            DigestFilter::Not(Box::new(DigestFilter::Gt {
                key: "total".into(),
                value: "50".into(),
            })),
        ]);
        assert!(tree.eval(&d));
    }

    #[test]
    fn invalid_regex_is_a_non_match() {
        let d = digest(&[("status", "open")]);
        assert!(!DigestFilter::Matches {
            key: "status".into(),
            pattern: "(".into()
        }
        .eval(&d));
    }

    #[test]
    fn chart_filter_over_facts() {
        let facts = ChartFacts {
            reference: ChartReference::new("orderMachine", "chart-9"),
            state_value: serde_json::json!({ "fulfilment": "packing" }),
            external_ids: vec![("orderNo".into(), "42".into())],
        };
        assert!(ChartFilter::MachineIdMatches("^order".into()).eval(&facts));
        assert!(ChartFilter::StateMatches("fulfilment.packing".into()).eval(&facts));
        assert!(ChartFilter::ExternalIdMatches {
            key: "orderNo".into(),
            pattern: "^4".into()
        }
        .eval(&facts));
        assert!(!ChartFilter::And(vec![
            ChartFilter::ChartIdMatches("^chart".into()),
            ChartFilter::StateMatches("fulfilment.shipped".into()),
        ])
        .eval(&facts));
    }
}
