//! Read-only access to the metrics store.
//!
//! [`MetricsSource`] is what the query orchestrator talks to. The live
//! implementation is [`crate::services::engine::MetricsEngine`]; tests use an
//! in-memory table. [`Statements`] renders the SQL every implementation backed by
//! MySQL shares, with identifiers taken only from [`SchemaConfig`].
//!
//! All timestamps crossing this trait are zone-less UTC.

use crate::config::{is_sql_identifier, SchemaConfig};
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{DeviceOwner, ResultSet, SearchField};

use async_trait::async_trait;
use chrono::NaiveDateTime;

/// Format timestamps are bound in.
pub const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Rows a device-owner search returns at most.
pub const SEARCH_LIMIT: usize = 200;

/// Row predicate on the metrics table after secondary identifiers are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `device_column = value`
    Device(String),
    /// `user_column = value`
    User(String),
    /// `device_column IN (...)`; never empty.
    Devices(Vec<String>),
}

/// One bounded fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub filter: RowFilter,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub limit: usize,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Whether any row matches `filter` with a timestamp in `[start, end]`.
    async fn exists(
        &self,
        filter: &RowFilter,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> TubscopeResult<bool>;

    /// Earliest and latest timestamp for `filter` over all history.
    async fn bounds(
        &self,
        filter: &RowFilter,
    ) -> TubscopeResult<(Option<NaiveDateTime>, Option<NaiveDateTime>)>;

    /// Latest timestamp strictly before `before`.
    async fn nearest_before(
        &self,
        filter: &RowFilter,
        before: NaiveDateTime,
    ) -> TubscopeResult<Option<NaiveDateTime>>;

    /// Earliest timestamp strictly after `after`.
    async fn nearest_after(
        &self,
        filter: &RowFilter,
        after: NaiveDateTime,
    ) -> TubscopeResult<Option<NaiveDateTime>>;

    /// Rows ordered by timestamp ascending, at most `request.limit`.
    async fn fetch(&self, request: &FetchRequest) -> TubscopeResult<ResultSet>;

    /// Device names behind a secondary device identifier.
    async fn resolve_device_names(&self, esp_ble_id: &str) -> TubscopeResult<Vec<String>>;

    /// Users (and their devices) whose `field` contains `needle`.
    async fn search_owners(
        &self,
        field: SearchField,
        needle: &str,
    ) -> TubscopeResult<Vec<DeviceOwner>>;

    /// Cheap round trip that forces connection setup.
    async fn warm_up(&self) -> TubscopeResult<()>;
}

/// Rendered SQL with positional string parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<String>,
}

/// Builds the statements the metrics store answers.
#[derive(Debug, Clone)]
pub struct Statements {
    schema: SchemaConfig,
}

impl Statements {
    pub fn new(schema: SchemaConfig) -> TubscopeResult<Self> {
        schema.validate()?;
        Ok(Self { schema })
    }

    pub fn schema(&self) -> &SchemaConfig {
        &self.schema
    }

    pub fn exists(
        &self,
        filter: &RowFilter,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> TubscopeResult<Statement> {
        let (predicate, mut params) = self.predicate(filter)?;
        let ts = quote_ident(&self.schema.timestamp_column);
        params.push(format_ts(start));
        params.push(format_ts(end));
        Ok(Statement {
            sql: format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE {predicate} AND {ts} BETWEEN ? AND ?) AS has_data",
                quote_ident(&self.schema.metrics_table),
            ),
            params,
        })
    }

    pub fn bounds(&self, filter: &RowFilter) -> TubscopeResult<Statement> {
        let (predicate, params) = self.predicate(filter)?;
        let ts = quote_ident(&self.schema.timestamp_column);
        Ok(Statement {
            sql: format!(
                "SELECT MIN({ts}) AS earliest, MAX({ts}) AS latest FROM {} WHERE {predicate}",
                quote_ident(&self.schema.metrics_table),
            ),
            params,
        })
    }

    pub fn nearest_before(
        &self,
        filter: &RowFilter,
        before: NaiveDateTime,
    ) -> TubscopeResult<Statement> {
        let (predicate, mut params) = self.predicate(filter)?;
        let ts = quote_ident(&self.schema.timestamp_column);
        params.push(format_ts(before));
        Ok(Statement {
            sql: format!(
                "SELECT MAX({ts}) AS nearest FROM {} WHERE {predicate} AND {ts} < ?",
                quote_ident(&self.schema.metrics_table),
            ),
            params,
        })
    }

    pub fn nearest_after(
        &self,
        filter: &RowFilter,
        after: NaiveDateTime,
    ) -> TubscopeResult<Statement> {
        let (predicate, mut params) = self.predicate(filter)?;
        let ts = quote_ident(&self.schema.timestamp_column);
        params.push(format_ts(after));
        Ok(Statement {
            sql: format!(
                "SELECT MIN({ts}) AS nearest FROM {} WHERE {predicate} AND {ts} > ?",
                quote_ident(&self.schema.metrics_table),
            ),
            params,
        })
    }

    pub fn fetch(&self, request: &FetchRequest) -> TubscopeResult<Statement> {
        let (predicate, mut params) = self.predicate(&request.filter)?;
        let ts = quote_ident(&self.schema.timestamp_column);
        let projection = self.projection(request.columns.as_deref())?;
        params.push(format_ts(request.start));
        params.push(format_ts(request.end));
        Ok(Statement {
            sql: format!(
                "SELECT {projection} FROM {} WHERE {predicate} AND {ts} BETWEEN ? AND ? ORDER BY {ts} ASC LIMIT {}",
                quote_ident(&self.schema.metrics_table),
                request.limit,
            ),
            params,
        })
    }

    /// Device names for a secondary identifier: ownership rows joined to metrics
    /// rows of the same user.
    pub fn resolve_device_names(&self, esp_ble_id: &str) -> Statement {
        let s = &self.schema;
        Statement {
            sql: format!(
                "SELECT DISTINCT m.{device} FROM {ownership} o JOIN {metrics} m ON m.{user} = o.{owner} \
                 WHERE o.{esp} = ? AND m.{device} IS NOT NULL",
                device = quote_ident(&s.device_column),
                ownership = quote_ident(&s.ownership_table),
                metrics = quote_ident(&s.metrics_table),
                user = quote_ident(&s.user_column),
                owner = quote_ident(&s.ownership_user_column),
                esp = quote_ident(&s.ownership_device_id_column),
            ),
            params: vec![esp_ble_id.to_string()],
        }
    }

    /// Profiles matching `needle` anywhere in `field`, with their devices.
    pub fn search_owners(&self, field: SearchField, needle: &str) -> Statement {
        let s = &self.schema;
        let column = match field {
            SearchField::FullName => &s.profile_name_column,
            SearchField::UserId => &s.profile_user_column,
        };
        Statement {
            sql: format!(
                "SELECT DISTINCT p.{puser} AS user_id, p.{pname} AS full_name, o.{esp} AS esp_ble_id \
                 FROM {profile} p LEFT JOIN {ownership} o ON o.{owner} = p.{puser} \
                 WHERE p.{column} LIKE ? LIMIT {SEARCH_LIMIT}",
                puser = quote_ident(&s.profile_user_column),
                pname = quote_ident(&s.profile_name_column),
                esp = quote_ident(&s.ownership_device_id_column),
                profile = quote_ident(&s.profile_table),
                ownership = quote_ident(&s.ownership_table),
                owner = quote_ident(&s.ownership_user_column),
                column = quote_ident(column),
            ),
            params: vec![format!("%{}%", escape_like(needle.trim()))],
        }
    }

    pub fn warm_up(&self) -> Statement {
        Statement {
            sql: format!(
                "SELECT {} FROM {} LIMIT 1",
                quote_ident(&self.schema.timestamp_column),
                quote_ident(&self.schema.metrics_table)
            ),
            params: Vec::new(),
        }
    }

    fn predicate(&self, filter: &RowFilter) -> TubscopeResult<(String, Vec<String>)> {
        let device = quote_ident(&self.schema.device_column);
        match filter {
            RowFilter::Device(value) => Ok((format!("{device} = ?"), vec![value.clone()])),
            RowFilter::User(value) => Ok((
                format!("{} = ?", quote_ident(&self.schema.user_column)),
                vec![value.clone()],
            )),
            RowFilter::Devices(names) if names.is_empty() => {
                Err(TubscopeError::internal("device set filter must not be empty"))
            }
            RowFilter::Devices(names) => {
                let marks = vec!["?"; names.len()].join(", ");
                Ok((format!("{device} IN ({marks})"), names.clone()))
            }
        }
    }

    fn projection(&self, columns: Option<&[String]>) -> TubscopeResult<String> {
        let Some(columns) = columns.filter(|c| !c.is_empty()) else {
            return Ok("*".to_string());
        };

        let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
        let ts = self.schema.timestamp_column.to_lowercase();
        names.push(ts.clone());
        for column in columns {
            let column = column.trim().to_lowercase();
            if column.contains('.') || !is_sql_identifier(&column) {
                return Err(TubscopeError::query(format!("'{column}' is not a valid column name")));
            }
            if !names.contains(&column) {
                names.push(column);
            }
        }
        Ok(names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", "))
    }
}

/// Backtick-quote a validated identifier, segment by segment.
pub fn quote_ident(name: &str) -> String {
    name.split('.').map(|seg| format!("`{seg}`")).collect::<Vec<_>>().join(".")
}

pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(SQL_TIMESTAMP_FORMAT).to_string()
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn statements() -> Statements {
        Statements::new(SchemaConfig::default()).unwrap()
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_exists_binds_utc_strings() {
        let stmt = statements().exists(&RowFilter::Device("tub-01".into()), at(8), at(9)).unwrap();
        assert!(stmt.sql.starts_with("SELECT EXISTS"));
        assert!(stmt.sql.contains("`device_name` = ?"));
        assert_eq!(
            stmt.params,
            vec!["tub-01", "2024-03-05 08:00:00.000000", "2024-03-05 09:00:00.000000"]
        );
    }

    #[test]
    fn test_fetch_is_ascending_and_limited() {
        let request = FetchRequest {
            filter: RowFilter::User("42".into()),
            start: at(0),
            end: at(23),
            columns: None,
            limit: 30_000,
        };
        let stmt = statements().fetch(&request).unwrap();
        assert!(stmt.sql.starts_with("SELECT * FROM `cp_device_metrics`"));
        assert!(stmt.sql.contains("`user_id` = ?"));
        assert!(stmt.sql.ends_with("ORDER BY `updated_at` ASC LIMIT 30000"));
    }

    #[test]
    fn test_projection_always_has_timestamp() {
        let request = FetchRequest {
            filter: RowFilter::Device("tub".into()),
            start: at(0),
            end: at(1),
            columns: Some(vec!["Water_Temp_C".into(), "updated_at".into()]),
            limit: 10,
        };
        let stmt = statements().fetch(&request).unwrap();
        assert!(stmt.sql.starts_with("SELECT `updated_at`, `water_temp_c` FROM"));
    }

    #[test]
    fn test_projection_rejects_injection() {
        let request = FetchRequest {
            filter: RowFilter::Device("tub".into()),
            start: at(0),
            end: at(1),
            columns: Some(vec!["a; DROP TABLE x".into()]),
            limit: 10,
        };
        assert!(statements().fetch(&request).is_err());
    }

    #[test]
    fn test_device_set_predicate() {
        let filter = RowFilter::Devices(vec!["a".into(), "b".into()]);
        let stmt = statements().bounds(&filter).unwrap();
        assert!(stmt.sql.contains("`device_name` IN (?, ?)"));
        assert_eq!(stmt.params, vec!["a", "b"]);

        assert!(statements().bounds(&RowFilter::Devices(Vec::new())).is_err());
    }

    #[test]
    fn test_resolve_devices_joins_ownership() {
        let stmt = statements().resolve_device_names("ESP-1");
        assert!(stmt.sql.contains("FROM `cpdevdb`.`user_cp_devices` o JOIN `cp_device_metrics` m"));
        assert!(stmt.sql.contains("o.`esp_ble_id` = ?"));
        assert_eq!(stmt.params, vec!["ESP-1"]);
    }

    #[test]
    fn test_search_escapes_like() {
        let stmt = statements().search_owners(SearchField::FullName, " 50%_off ");
        assert!(stmt.sql.contains("p.`full_name` LIKE ? LIMIT 200"));
        assert_eq!(stmt.params, vec![r"%50\%\_off%"]);
    }

    #[test]
    fn test_nearest_statements_are_strict() {
        let s = statements();
        let filter = RowFilter::Device("tub".into());
        assert!(s.nearest_before(&filter, at(0)).unwrap().sql.contains("MAX(`updated_at`)"));
        assert!(s.nearest_before(&filter, at(0)).unwrap().sql.ends_with("`updated_at` < ?"));
        assert!(s.nearest_after(&filter, at(0)).unwrap().sql.ends_with("`updated_at` > ?"));
    }
}
