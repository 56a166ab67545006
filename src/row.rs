//! Result rows.
//!
//! Rows keep the raw column bytes from DataRow and decode them on demand
//! through the registry, so a row that is never read costs no conversion.

use std::sync::Arc;

use crate::connection::PgConnection;
use crate::error::{PgError, PgResult};
use crate::protocol::{FieldDescription, RowValues};
use crate::registry::Registry;
use crate::statement::SharedColumns;
use crate::types::PgValue;

// ============================================================================
// Row
// ============================================================================

#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: RowValues,
    registry: Arc<Registry>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: RowValues, registry: Arc<Registry>) -> Self {
        Self {
            columns,
            values,
            registry,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Decode column `idx`. NULL decodes to [`PgValue::Null`].
    pub fn get(&self, idx: usize) -> PgResult<PgValue> {
        let raw = self
            .values
            .get(idx)
            .ok_or_else(|| PgError::Type(format!("Column index {} out of range ({} columns)", idx, self.len())))?;
        let Some(data) = raw else {
            return Ok(PgValue::Null);
        };
        let column = self
            .columns
            .get(idx)
            .ok_or_else(|| PgError::protocol(format!("No description for column {}", idx)))?;
        self.registry.decode(column.type_oid, column.format, data)
    }

    pub fn get_by_name(&self, name: &str) -> PgResult<PgValue> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| PgError::Type(format!("No column named {:?}", name)))?;
        self.get(idx)
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None))
    }

    /// Undecoded bytes of column `idx`; `None` for NULL or out of range.
    pub fn raw(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    /// Decode every column.
    pub fn values(&self) -> PgResult<Vec<PgValue>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

// ============================================================================
// QueryResult
// ============================================================================

/// A fully buffered result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// e.g. "SELECT 5" or "INSERT 0 1"
    pub command_tag: String,
}

impl QueryResult {
    pub(crate) fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    /// Rows affected as reported in the command tag; 0 when the tag carries no count.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

pub(crate) fn parse_rows_affected(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["MOVE", n]
        | ["FETCH", n]
        | ["COPY", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

// ============================================================================
// RowStream
// ============================================================================

/// Rows of one execution, pulled from the socket as they are requested.
///
/// The stream borrows the connection exclusively. Dropping it before the
/// end leaves the connection draining: the remaining messages are discarded
/// at the start of the next operation.
pub struct RowStream<'c> {
    conn: &'c mut PgConnection,
    columns: SharedColumns,
    command_tag: String,
    done: bool,
}

impl<'c> RowStream<'c> {
    pub(crate) fn new(conn: &'c mut PgConnection, columns: SharedColumns) -> Self {
        Self {
            conn,
            columns,
            command_tag: String::new(),
            done: false,
        }
    }

    /// Next row, or `None` once the server finished the command.
    pub async fn next(&mut self) -> PgResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        match self.conn.stream_next(&mut self.command_tag).await {
            Ok(Some(values)) => Ok(Some(Row::new(
                Arc::clone(&self.columns),
                values,
                Arc::clone(self.conn.registry()),
            ))),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// Command tag, available once the stream is exhausted.
    pub fn command_tag(&self) -> Option<&str> {
        (self.done && !self.command_tag.is_empty()).then_some(self.command_tag.as_str())
    }

    /// Read the remaining rows into a buffered result.
    pub async fn collect(mut self) -> PgResult<QueryResult> {
        let mut result = QueryResult::new(Arc::clone(&self.columns));
        while let Some(row) = self.next().await? {
            result.rows.push(row);
        }
        result.command_tag = std::mem::take(&mut self.command_tag);
        Ok(result)
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.mark_draining();
        }
    }
}
