//! The generic vocabulary the gateway speaks: named resources, JSON rows,
//! equality filters and single-column ordering.

use serde_json::{Map, Value};

/// The resources the application stores remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Profiles,
    Messages,
    Posts,
    Upvotes,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Profiles => "profiles",
            Resource::Messages => "messages",
            Resource::Posts => "posts",
            Resource::Upvotes => "upvotes",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway row: a flat JSON object keyed by column name.
pub type Row = Map<String, Value>;

/// A conjunction of `column = value` equality tests.
///
/// This is the only predicate shape the gateway supports; anything richer
/// (disjunctions, ranges) is the consumer's job after fetching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// The empty filter, matching every row.
    pub fn any() -> Self {
        Self::default()
    }

    /// Add an equality clause.
    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((column.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether a row satisfies every clause.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

/// Sort order for query results: one column, ascending or descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub column: String,
    pub descending: bool,
}

impl Ordering {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let r = row(&[("id", json!("1"))]);
        assert!(Filter::any().matches(&r));
    }

    #[test]
    fn all_clauses_must_hold() {
        let r = row(&[("a", json!("x")), ("b", json!(2))]);
        assert!(Filter::any().eq("a", "x").eq("b", 2).matches(&r));
        assert!(!Filter::any().eq("a", "x").eq("b", 3).matches(&r));
        assert!(!Filter::any().eq("missing", "x").matches(&r));
    }
}
