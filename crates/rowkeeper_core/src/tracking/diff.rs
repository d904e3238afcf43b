//! Membership diffing and comparison strings.
//!
//! A comparison string is the canonical, order-independent rendering of a
//! collection's member keys: sorted, deduplicated, joined with `,`. The empty
//! set renders as `Value::Null` so an empty list column and a missing list
//! compare equal.

use crate::model::value::Value;
use std::collections::BTreeSet;

const MEMBER_SEPARATOR: char = ',';

/// Members added and removed relative to the last persisted membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_members(current: &BTreeSet<String>, baseline: &BTreeSet<String>) -> CollectionDiff {
    CollectionDiff {
        added: current.difference(baseline).cloned().collect(),
        removed: baseline.difference(current).cloned().collect(),
    }
}

/// Membership as it was before the pending change: current plus removed,
/// minus added.
pub fn prior_membership(current: &BTreeSet<String>, diff: &CollectionDiff) -> BTreeSet<String> {
    current
        .union(&diff.removed)
        .filter(|key| !diff.added.contains(*key))
        .cloned()
        .collect()
}

pub fn membership_value<I, S>(keys: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let keys: BTreeSet<String> = keys
        .into_iter()
        .map(|key| key.as_ref().trim().to_string())
        .filter(|key| !key.is_empty())
        .collect();
    if keys.is_empty() {
        return Value::Null;
    }
    Value::Text(
        keys.into_iter()
            .collect::<Vec<_>>()
            .join(&MEMBER_SEPARATOR.to_string()),
    )
}

pub fn parse_membership(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Text(text) => text
            .split(MEMBER_SEPARATOR)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Re-renders a stored list column in canonical form.
pub fn canonical_membership(value: &Value) -> Value {
    membership_value(parse_membership(value))
}
