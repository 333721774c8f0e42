//! Persistence interface consumed by the consent ledger.
//!
//! Rows are JSON objects, the shape a hosted relational backend returns. Every
//! call either yields data or a [`StoreError`] value; nothing panics across
//! this boundary.
//!
//! # Module invariants
//!
//! - `update` applies one patch to every matching row as a single atomic write.
//! - No locking is orchestrated above this interface; concurrent writers to
//!   the same row are last-writer-wins.

pub mod memory;

pub use memory::MemoryStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// A JSON object row.
pub type Row = serde_json::Map<String, Value>;

/// Profile rows; sensitive columns hold sealed tokens.
pub const PROFILES: &str = "profiles";
/// One current consent row per student (`student_id` is unique).
pub const STUDENT_CONSENTS: &str = "student_consents";
/// Append-only consent history.
pub const CONSENT_EVENTS: &str = "consent_events";

/// Errors produced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness or other constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The request or the stored data is not well-formed.
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// A row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if `row` satisfies this predicate. A missing column
    /// compares as JSON `null`.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column).unwrap_or(&Value::Null) == value,
            Filter::In(column, values) => {
                let cell = row.get(column).unwrap_or(&Value::Null);
                values.iter().any(|v| v == cell)
            }
        }
    }
}

/// Sort order for [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// A select request: filters, optional ordering, optional offset/limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// `(offset, limit)`
    pub range: Option<(usize, usize)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some((offset, limit));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// Relational persistence collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Rows of `table` matching `query`.
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Number of rows of `table` matching every filter.
    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Insert one row and return it as stored.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Apply `patch` to every matching row in one write; returns the updated rows.
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>, StoreError>;

    /// Delete every matching row; returns how many were removed.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError>;
}

/// Ordering used by [`Query::order`]: numbers numerically, RFC 3339
/// timestamps chronologically, other strings lexically, `null` first.
pub(crate) fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null)) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(tx), Ok(ty)) => tx.cmp(&ty),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
