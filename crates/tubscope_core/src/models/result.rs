//! Query results, availability bounds and the tagged query outcome.

use crate::error::TubscopeError;
use crate::models::MetricsFilter;

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Canonical name of the timestamp column in every normalized result.
pub const TIMESTAMP_COLUMN: &str = "updated_at";

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the cell. Text is parsed; bytes and timestamps are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bytes(b) => std::str::from_utf8(b).ok().and_then(|s| s.trim().parse().ok()),
            Self::Null | Self::Timestamp(_) => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str(""),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Rows with named columns. Row cells are in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// All values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Cell at `row` in column `name`.
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Timestamps of a normalized result.
    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.column(TIMESTAMP_COLUMN)
            .map(|col| col.into_iter().filter_map(Value::as_timestamp).collect())
            .unwrap_or_default()
    }

    /// First non-null value of `name`, e.g. the device a result belongs to.
    pub fn first_non_null(&self, name: &str) -> Option<&Value> {
        self.column(name)?.into_iter().find(|v| !v.is_null())
    }
}

/// True data availability for a filter, independent of any requested window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilityBounds {
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
    pub nearest_before: Option<NaiveDateTime>,
    pub nearest_after: Option<NaiveDateTime>,
}

impl AvailabilityBounds {
    /// The `(earliest, latest)` pair.
    pub fn range(&self) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
        (self.earliest, self.latest)
    }

    /// Whether any row exists for the filter.
    pub fn has_history(&self) -> bool {
        self.earliest.is_some() && self.latest.is_some()
    }
}

/// Structured "nothing here" signal for a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoDataInWindow {
    pub filter: MetricsFilter,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
    pub nearest_before: Option<NaiveDateTime>,
    pub nearest_after: Option<NaiveDateTime>,
}

impl NoDataInWindow {
    pub fn new(
        filter: MetricsFilter,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
        bounds: AvailabilityBounds,
    ) -> Self {
        Self {
            filter,
            window_start,
            window_end,
            earliest: bounds.earliest,
            latest: bounds.latest,
            nearest_before: bounds.nearest_before,
            nearest_after: bounds.nearest_after,
        }
    }

    /// False when the filter has never produced a row.
    pub fn has_history(&self) -> bool {
        self.earliest.is_some() && self.latest.is_some()
    }

    pub fn bounds(&self) -> AvailabilityBounds {
        AvailabilityBounds {
            earliest: self.earliest,
            latest: self.latest,
            nearest_before: self.nearest_before,
            nearest_after: self.nearest_after,
        }
    }

    /// Nearest-row details for display, if any were found.
    pub fn detail(&self) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(before) = self.nearest_before {
            lines.push(format!("Nearest earlier row: {}", before.format("%Y-%m-%d %H:%M:%S")));
        }
        if let Some(after) = self.nearest_after {
            lines.push(format!("Nearest later row: {}", after.format("%Y-%m-%d %H:%M:%S")));
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

impl fmt::Display for NoDataInWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.earliest, self.latest) {
            (Some(earliest), Some(latest)) => write!(
                f,
                "No data in requested window. Data for {} exists from {} to {}",
                self.filter,
                earliest.format("%Y-%m-%d"),
                latest.format("%Y-%m-%d")
            ),
            _ => write!(f, "No data exists for {} at all", self.filter),
        }
    }
}

/// Outcome of one orchestrated query.
#[derive(Debug)]
pub enum QueryOutcome {
    /// Normalized rows.
    Found(ResultSet),
    /// The window is empty; bounds say where data does exist.
    Empty(NoDataInWindow),
    /// The query could not be answered.
    Failed(TubscopeError),
}

impl QueryOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty(_))
    }

    /// Collapse into a `Result`, turning an empty window into
    /// [`TubscopeError::NoDataInWindow`].
    pub fn into_result(self) -> Result<ResultSet, TubscopeError> {
        match self {
            Self::Found(rows) => Ok(rows),
            Self::Empty(empty) => Err(TubscopeError::NoDataInWindow(empty)),
            Self::Failed(err) => Err(err),
        }
    }
}

impl From<Result<QueryOutcome, TubscopeError>> for QueryOutcome {
    fn from(result: Result<QueryOutcome, TubscopeError>) -> Self {
        result.unwrap_or_else(QueryOutcome::Failed)
    }
}
