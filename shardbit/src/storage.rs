use crate::error::AppError;
use crate::transcode::Scalar;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stored record: flat attribute map.
pub type Item = HashMap<String, Scalar>;

/// Physical key of one stored item: partition composite plus range composite.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub hash: String,
    pub range: String,
}

/// Operators a driver must support against the physical range composite.
/// The query engine rewrites logical `<=`, `>` and equality conditions into
/// these (adding upper-bound sentinels), so drivers only ever see this set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOp {
    /// Exact match on the full composite.
    Eq,
    /// Anything but an exact match on the full composite.
    Ne,
    /// Strictly below the bound.
    Lt,
    /// At or above the bound.
    Ge,
    /// Half-open interval: lower inclusive, upper exclusive.
    Between,
    /// Composite starts with the bound.
    BeginsWith,
    /// Composite does not start with the bound.
    NotBeginsWith,
}

/// Range-key condition compiled against the physical range composite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeCondition {
    pub op: RangeOp,
    pub values: Vec<String>,
}

impl RangeCondition {
    pub fn new(op: RangeOp, values: Vec<String>) -> Self {
        Self { op, values }
    }

    /// Reference semantics of each operator over plain string comparison.
    /// Backends must implement exactly this; the in-memory driver uses it
    /// directly.
    pub fn matches(&self, composite: &str) -> bool {
        match self.op {
            RangeOp::Eq => composite == self.values[0],
            RangeOp::Ne => composite != self.values[0],
            RangeOp::Lt => composite < self.values[0].as_str(),
            RangeOp::Ge => composite >= self.values[0].as_str(),
            RangeOp::Between => {
                composite >= self.values[0].as_str() && composite < self.values[1].as_str()
            }
            RangeOp::BeginsWith => composite.starts_with(&self.values[0]),
            RangeOp::NotBeginsWith => !composite.starts_with(&self.values[0]),
        }
    }
}

/// Compiled filter expression plus its name/value bindings. Marshaling this
/// into the backend's own syntax is the driver's job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterExpression {
    pub expression: String,
    /// Placeholder -> property name.
    pub names: Vec<(String, String)>,
    /// Placeholder -> bound literal.
    pub values: Vec<(String, Scalar)>,
}

/// One physical query against one shard of one index.
#[derive(Clone, Debug)]
pub struct IndexQueryRequest {
    pub table: String,
    pub index: String,
    /// Physical partition composite, shard token included.
    pub hash_key: String,
    pub range: Option<RangeCondition>,
    pub filter: Option<FilterExpression>,
    pub projection: Option<Vec<String>>,
    /// Exclusive start: range composite of the boundary item. Items are
    /// returned strictly after it in scan direction.
    pub page_key: Option<String>,
    pub page_size: usize,
    pub scan_forward: bool,
}

#[derive(Clone, Debug, Default)]
pub struct IndexQueryPage {
    pub items: Vec<Item>,
    /// Range composite to resume this shard from, absent when drained.
    pub page_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchWriteResult {
    pub unprocessed_puts: Vec<Item>,
    pub unprocessed_deletes: Vec<ItemKey>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchGetResult {
    pub items: Vec<Item>,
    pub unprocessed_keys: Vec<ItemKey>,
}

/// The storage collaborator. Implementations own request marshaling,
/// connection management and table administration. Contract points the
/// engine relies on:
///
/// - one shard's page order is the backend's own order over the range
///   composite, reversed when `scan_forward` is false;
/// - `page_key` resumes strictly after the given composite;
/// - deleting an item that no longer exists is a success, not an error;
/// - unprocessed batch entries are reported back verbatim, never dropped.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    async fn run_index_query(&self, req: IndexQueryRequest) -> Result<IndexQueryPage, AppError>;

    async fn run_batch_write(
        &self,
        table: &str,
        puts: Vec<Item>,
        deletes: Vec<ItemKey>,
    ) -> Result<BatchWriteResult, AppError>;

    async fn run_batch_get(&self, table: &str, keys: Vec<ItemKey>) -> Result<BatchGetResult, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(op: RangeOp, values: &[&str]) -> RangeCondition {
        RangeCondition::new(op, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn eq_requires_full_composite() {
        let c = cond(RangeOp::Eq, &["id#abc"]);
        assert!(c.matches("id#abc"));
        assert!(!c.matches("id#abcd"));
    }

    #[test]
    fn lt_and_ge_are_strict_and_inclusive() {
        let c = cond(RangeOp::Lt, &["created#15"]);
        assert!(c.matches("created#14"));
        assert!(!c.matches("created#15"));
        let c = cond(RangeOp::Ge, &["created#15"]);
        assert!(c.matches("created#15"));
        assert!(!c.matches("created#14"));
    }

    #[test]
    fn between_is_half_open() {
        let c = cond(RangeOp::Between, &["a", "c"]);
        assert!(c.matches("a"));
        assert!(c.matches("b"));
        assert!(!c.matches("c"));
    }

    #[test]
    fn begins_with_and_negation() {
        let c = cond(RangeOp::BeginsWith, &["created#15|"]);
        assert!(c.matches("created#15|id#x"));
        assert!(!c.matches("created#150|id#x"));
        let c = cond(RangeOp::NotBeginsWith, &["created#15|"]);
        assert!(!c.matches("created#15|id#x"));
        assert!(c.matches("created#16|id#x"));
    }
}
