//! Entity identifiers and the ordered entity set.
//!
//! An entity is a ticker symbol. The set is an ordered sequence, not a
//! mathematical set: duplicates are kept and order is preserved so that
//! fetch results can be correlated back by position.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized (trimmed, uppercase) ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Normalize a raw ticker into an `EntityId`.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Normalize every raw ticker, keeping order and duplicates.
pub fn normalize<S: AsRef<str>>(raw: &[S]) -> Vec<EntityId> {
    raw.iter().map(EntityId::new).collect()
}

/// Drop every entity that appears in `skip`, compared case-insensitively.
///
/// Order of the remaining entities is preserved. An empty skip list returns
/// the input unchanged.
pub fn exclude<S: AsRef<str>>(entities: Vec<EntityId>, skip: &[S]) -> Vec<EntityId> {
    if skip.is_empty() {
        return entities;
    }
    let skip: Vec<EntityId> = normalize(skip);
    entities
        .into_iter()
        .filter(|e| !skip.contains(e))
        .collect()
}

/// Split a comma-separated ticker list (`"aapl, msft"`) into entities.
pub fn parse_list(raw: &str) -> Vec<EntityId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(EntityId::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let ids = normalize(&[" aapl", "Msft ", "BRK.b"]);
        let names: Vec<&str> = ids.iter().map(|e| e.as_str()).collect();
        assert_eq!(names, vec!["AAPL", "MSFT", "BRK.B"]);
    }

    #[test]
    fn keeps_duplicates_in_order() {
        let ids = normalize(&["spy", "qqq", "SPY"]);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ids[2]);
    }

    #[test]
    fn exclude_is_case_insensitive() {
        let ids = normalize(&["AAPL", "MSFT", "GOOGL", "msft"]);
        let kept = exclude(ids, &["Msft"]);
        let names: Vec<&str> = kept.iter().map(|e| e.as_str()).collect();
        assert_eq!(names, vec!["AAPL", "GOOGL"]);
    }

    #[test]
    fn exclude_with_empty_skip_list_is_noop() {
        let ids = normalize(&["AAPL", "MSFT"]);
        let empty: [&str; 0] = [];
        assert_eq!(exclude(ids.clone(), &empty), ids);
    }

    #[test]
    fn parse_list_splits_and_normalizes() {
        let ids = parse_list("aapl, msft,,spy ");
        assert_eq!(ids, normalize(&["AAPL", "MSFT", "SPY"]));
    }
}
