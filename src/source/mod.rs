// ABOUTME: Source-side capability interface and the data it produces
// ABOUTME: Every vendor adapter answers the same seven questions; the engine never sees SQL

pub mod sqlite;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::SourceResult;

pub use sqlite::{SqliteSource, TimeEncoding};

/// A column of a source data table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Zero-based ordinal position in the table definition
    pub position: usize,
}

impl SourceColumn {
    pub fn new(name: &str, position: usize) -> Self {
        Self {
            name: name.to_string(),
            position,
        }
    }
}

/// A time-series table discovered in a source database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub database_name: String,
    /// Data table holding the time series
    pub table_name: String,
    /// Identifier read from the companion info table; correlates the table with
    /// a destination asset
    pub controller_id: String,
    /// Sensor columns of the data table (time column excluded)
    pub all_columns: Vec<SourceColumn>,
}

impl SourceTable {
    pub fn column(&self, name: &str) -> Option<&SourceColumn> {
        self.all_columns.iter().find(|c| c.name == name)
    }
}

/// Result of a discovery pass. Databases are listed even when none of their
/// tables qualified, so the mapper can tell "no database" from "no tables".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub databases: BTreeSet<String>,
    pub tables: Vec<SourceTable>,
}

impl ScanResult {
    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains(name)
    }

    pub fn tables_in<'a>(&'a self, database: &'a str) -> impl Iterator<Item = &'a SourceTable> {
        self.tables
            .iter()
            .filter(move |t| t.database_name == database)
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<&SourceTable> {
        self.tables
            .iter()
            .find(|t| t.database_name == database && t.table_name == table)
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// One row of a range query. `values` is positionally aligned with the
/// columns that were requested; `None` marks a null (or non-numeric) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub time: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

/// Capabilities the engine needs from a source.
///
/// Implementations are used from a single task and are not required to be
/// thread-safe. An empty result is `Ok(None)` / `Ok(vec![])`; errors are
/// reserved for vanished objects and failed queries.
pub trait SourceAdapter {
    fn list_databases(&self) -> SourceResult<Vec<String>>;

    fn list_tables(&self, database: &str) -> SourceResult<Vec<String>>;

    /// Columns of `table` except the time column.
    fn table_columns(&self, database: &str, table: &str) -> SourceResult<Vec<SourceColumn>>;

    /// Value of `column` in the first row of an info table.
    fn controller_id(
        &self,
        database: &str,
        info_table: &str,
        column: &str,
    ) -> SourceResult<Option<String>>;

    /// Rows with time in `range`, ordered by time ascending.
    fn query_range(
        &self,
        database: &str,
        table: &str,
        columns: &[String],
        range: TimeRange,
    ) -> SourceResult<Vec<SourceRow>>;

    fn first_time(&self, database: &str, table: &str) -> SourceResult<Option<DateTime<Utc>>>;

    fn last_write_time(&self, database: &str, table: &str) -> SourceResult<Option<DateTime<Utc>>>;
}
