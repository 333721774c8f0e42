//! [`MemoryStore`]: in-process [`Store`] backed by a `tokio` `RwLock`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{compare_cells, Filter, Query, Row, Store, StoreError, STUDENT_CONSENTS};

/// Thread-safe in-memory tables.
///
/// Every call takes the lock once, so an `update` is applied to all matching
/// rows atomically with respect to other callers.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
    unique: Arc<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    /// An empty store without constraints.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store with the constraints of the application schema.
    pub fn with_schema() -> Self {
        Self::new().with_unique(STUDENT_CONSENTS, "student_id")
    }

    /// Reject inserts that would duplicate a non-null `column` value in `table`.
    pub fn with_unique(self, table: &str, column: &str) -> Self {
        let mut unique = (*self.unique).clone();
        unique
            .entry(table.to_owned())
            .or_default()
            .push(column.to_owned());
        Self {
            tables: self.tables,
            unique: Arc::new(unique),
        }
    }

    fn check_unique(&self, table: &str, rows: &[Row], candidate: &Row) -> Result<(), StoreError> {
        let Some(columns) = self.unique.get(table) else {
            return Ok(());
        };
        for column in columns {
            let Some(value) = candidate.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            if rows.iter().any(|r| r.get(column) == Some(value)) {
                return Err(StoreError::Constraint(format!(
                    "duplicate value for {table}.{column}"
                )));
            }
        }
        Ok(())
    }
}

fn matches_all(filters: &[Filter], row: &Row) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_cells(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some((offset, limit)) = query.range {
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }
        Ok(rows)
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        let n = tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches_all(filters, r)).count())
            .unwrap_or(0);
        Ok(n as u64)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_owned()).or_default();
        self.check_unique(table, rows, &row)?;
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::new();
        for row in rows.iter_mut().filter(|r| matches_all(filters, r)) {
            for (column, value) in &patch {
                row.insert(column.clone(), value.clone());
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !matches_all(filters, r));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Number of rows currently in `table`.
    pub async fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Raw copy of a table, as the backend would hold it.
    pub async fn dump(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite one column of every matching row without going through the
    /// patch path; used to simulate damaged data.
    pub async fn set_cell(
        &self,
        table: &str,
        filters: &[Filter],
        column: &str,
        value: serde_json::Value,
    ) {
        if let Some(rows) = self.tables.write().await.get_mut(table) {
            for row in rows.iter_mut().filter(|r| matches_all(filters, r)) {
                row.insert(column.to_owned(), value.clone());
            }
        }
    }
}
