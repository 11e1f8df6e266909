//! Pooled MySQL engine reached through the local forwarder.

use crate::config::SchemaConfig;
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{ConnectionOptions, DeviceOwner, ResultSet, SearchField, Value};
use crate::services::source::{FetchRequest, MetricsSource, RowFilter, Statement, Statements};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts};
use std::time::Duration;

/// Database login for the tunnelled server.
#[derive(Clone)]
pub struct DbLogin {
    pub user: String,
    pub password: String,
    pub database: String,
}

impl std::fmt::Debug for DbLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLogin")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Connection pool plus the statements it runs.
///
/// Every connection handed out has been pinged first; a dead one is discarded
/// and replaced once. Connections are recycled after `pool_recycle` regardless
/// of use, and each session starts with a server-side statement time limit.
pub struct MetricsEngine {
    pool: Pool,
    statements: Statements,
    acquire_timeout: Duration,
    local_port: u16,
}

impl MetricsEngine {
    /// Build the pool against `127.0.0.1:local_port`. Does not connect.
    pub fn new(
        local_port: u16,
        login: &DbLogin,
        schema: SchemaConfig,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Self> {
        let statements = Statements::new(schema)?;

        let constraints = PoolConstraints::new(0, options.pool_max_size.max(1)).ok_or_else(|| {
            TubscopeError::config(format!(
                "Invalid pool size {} for the database pool",
                options.pool_max_size
            ))
        })?;
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_abs_conn_ttl(Some(options.pool_recycle()))
            .with_reset_connection(false);

        let opts = OptsBuilder::default()
            .ip_or_hostname("127.0.0.1")
            .tcp_port(local_port)
            .prefer_socket(false)
            .user(Some(login.user.clone()))
            .pass(Some(login.password.clone()))
            .db_name(Some(login.database.clone()))
            .init(vec![format!(
                "SET SESSION MAX_EXECUTION_TIME={}",
                options.max_execution_time_ms
            )])
            .pool_opts(pool_opts);

        tracing::debug!(local_port, database = %login.database, "Database pool created");

        Ok(Self {
            pool: Pool::new(opts),
            statements,
            acquire_timeout: options.db_connect_timeout(),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// `SELECT 1` round trip.
    pub async fn verify(&self) -> TubscopeResult<()> {
        let mut conn = self.conn().await?;
        let one: Option<i64> = conn.query_first("SELECT 1").await?;
        if one != Some(1) {
            return Err(TubscopeError::connection("Database liveness check returned no row"));
        }
        tracing::debug!(local_port = self.local_port, "Database liveness check passed");
        Ok(())
    }

    /// Close every pooled connection. Errors are logged and dropped.
    pub async fn dispose(&self) {
        let pool = self.pool.clone();
        match tokio::time::timeout(self.acquire_timeout, pool.disconnect()).await {
            Ok(Ok(())) => tracing::debug!(local_port = self.local_port, "Database pool disposed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Database pool did not close cleanly"),
            Err(_) => tracing::warn!("Timed out disposing database pool"),
        }
    }

    /// Pre-pinged connection from the pool.
    async fn conn(&self) -> TubscopeResult<Conn> {
        let acquire = async {
            let mut conn = self.pool.get_conn().await?;
            if let Err(e) = conn.ping().await {
                tracing::debug!(error = %e, "Pooled connection failed ping, replacing");
                let _ = conn.disconnect().await;
                conn = self.pool.get_conn().await?;
                conn.ping().await?;
            }
            Ok::<Conn, mysql_async::Error>(conn)
        };

        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(result) => result.map_err(TubscopeError::from),
            Err(_) => Err(TubscopeError::connection(format!(
                "Timed out after {}s waiting for a database connection",
                self.acquire_timeout.as_secs()
            ))),
        }
    }

    /// Run `stmt` and collect every row with column names.
    async fn run(&self, stmt: Statement) -> TubscopeResult<ResultSet> {
        let mut conn = self.conn().await?;
        let params = bind(stmt.params);
        let mut result = conn.exec_iter(stmt.sql.as_str(), params).await?;

        let columns: Vec<(String, ColumnType)> = result
            .columns_ref()
            .iter()
            .map(|c| (c.name_str().into_owned(), c.column_type()))
            .collect();
        let raw_rows: Vec<mysql_async::Row> = result.collect().await?;
        drop(result);

        let rows = raw_rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, (_, ty))| {
                        let raw = row.take::<mysql_async::Value, _>(idx).unwrap_or(mysql_async::Value::NULL);
                        convert_value(raw, *ty)
                    })
                    .collect()
            })
            .collect();

        Ok(ResultSet::new(columns.into_iter().map(|(name, _)| name).collect(), rows))
    }

    async fn scalar_timestamp(&self, stmt: Statement) -> TubscopeResult<Option<NaiveDateTime>> {
        let set = self.run(stmt).await?;
        Ok(set.rows.first().and_then(|row| row.first()).and_then(timestamp_of))
    }
}

#[async_trait]
impl MetricsSource for MetricsEngine {
    async fn exists(
        &self,
        filter: &RowFilter,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> TubscopeResult<bool> {
        let set = self.run(self.statements.exists(filter, start, end)?).await?;
        Ok(set
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_f64)
            .is_some_and(|v| v != 0.0))
    }

    async fn bounds(
        &self,
        filter: &RowFilter,
    ) -> TubscopeResult<(Option<NaiveDateTime>, Option<NaiveDateTime>)> {
        let set = self.run(self.statements.bounds(filter)?).await?;
        let Some(row) = set.rows.first() else {
            return Ok((None, None));
        };
        Ok((row.first().and_then(timestamp_of), row.get(1).and_then(timestamp_of)))
    }

    async fn nearest_before(
        &self,
        filter: &RowFilter,
        before: NaiveDateTime,
    ) -> TubscopeResult<Option<NaiveDateTime>> {
        self.scalar_timestamp(self.statements.nearest_before(filter, before)?).await
    }

    async fn nearest_after(
        &self,
        filter: &RowFilter,
        after: NaiveDateTime,
    ) -> TubscopeResult<Option<NaiveDateTime>> {
        self.scalar_timestamp(self.statements.nearest_after(filter, after)?).await
    }

    async fn fetch(&self, request: &FetchRequest) -> TubscopeResult<ResultSet> {
        let set = self.run(self.statements.fetch(request)?).await?;
        tracing::debug!(rows = set.row_count(), columns = set.columns.len(), "Fetched metrics");
        Ok(set)
    }

    async fn resolve_device_names(&self, esp_ble_id: &str) -> TubscopeResult<Vec<String>> {
        let set = self.run(self.statements.resolve_device_names(esp_ble_id)).await?;
        Ok(set
            .rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|v| v.as_str().map(str::to_string).or_else(|| non_null_text(v)))
            .collect())
    }

    async fn search_owners(
        &self,
        field: SearchField,
        needle: &str,
    ) -> TubscopeResult<Vec<DeviceOwner>> {
        let set = self.run(self.statements.search_owners(field, needle)).await?;
        Ok(set
            .rows
            .iter()
            .map(|row| DeviceOwner {
                user_id: row.first().and_then(non_null_text).unwrap_or_default(),
                full_name: row.get(1).and_then(non_null_text).unwrap_or_default(),
                esp_ble_id: row.get(2).and_then(non_null_text),
            })
            .collect())
    }

    async fn warm_up(&self) -> TubscopeResult<()> {
        self.run(self.statements.warm_up()).await.map(|_| ())
    }
}

fn bind(params: Vec<String>) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.into_iter().map(mysql_async::Value::from).collect())
    }
}

fn non_null_text(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn timestamp_of(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Text(s) => parse_sql_timestamp(s),
        _ => None,
    }
}

fn parse_sql_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// Convert a driver value using the column type to read text-protocol bytes.
fn convert_value(raw: mysql_async::Value, col_type: ColumnType) -> Value {
    match raw {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(bytes) => {
            let Ok(s) = String::from_utf8(bytes.clone()) else {
                return Value::Bytes(bytes);
            };
            match col_type {
                ColumnType::MYSQL_TYPE_TINY
                | ColumnType::MYSQL_TYPE_SHORT
                | ColumnType::MYSQL_TYPE_LONG
                | ColumnType::MYSQL_TYPE_LONGLONG
                | ColumnType::MYSQL_TYPE_INT24
                | ColumnType::MYSQL_TYPE_YEAR => s.parse().map(Value::Int).unwrap_or(Value::Text(s)),
                ColumnType::MYSQL_TYPE_FLOAT
                | ColumnType::MYSQL_TYPE_DOUBLE
                | ColumnType::MYSQL_TYPE_DECIMAL
                | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                    s.parse().map(Value::Float).unwrap_or(Value::Text(s))
                }
                ColumnType::MYSQL_TYPE_DATETIME
                | ColumnType::MYSQL_TYPE_DATETIME2
                | ColumnType::MYSQL_TYPE_TIMESTAMP
                | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
                    parse_sql_timestamp(&s).map(Value::Timestamp).unwrap_or(Value::Text(s))
                }
                _ => Value::Text(s),
            }
        }
        mysql_async::Value::Int(i) => Value::Int(i),
        mysql_async::Value::UInt(u) => i64::try_from(u).map(Value::Int).unwrap_or(Value::Float(u as f64)),
        mysql_async::Value::Float(f) => Value::Float(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| d.and_hms_micro_opt(u32::from(hour), u32::from(min), u32::from(sec), micro))
                .map(Value::Timestamp)
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(negative, days, hours, mins, secs, micros) => {
            let total_hours = days * 24 + u32::from(hours);
            let sign = if negative { "-" } else { "" };
            Value::Text(format!("{sign}{total_hours:02}:{mins:02}:{secs:02}.{micros:06}"))
        }
    }
}
