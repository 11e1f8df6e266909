//! Query orchestration over the metrics store.
//!
//! [`QueryOrchestrator::run`] resolves a calendar window, probes whether any row
//! falls inside it, and then either fetches and normalizes the rows or explains
//! where data does exist:
//!
//! 1. Resolve the window in the reference zone and convert its bounds to UTC
//! 2. Resolve `esp_ble_id` filters to the owning devices
//! 3. Existence probe; on a hit, bounded ascending fetch and normalization
//! 4. On a miss, whole-history bounds plus the nearest rows on either side
//!
//! Operator-facing messages go through a [`LogSink`] in addition to `tracing`.

use crate::config::TemperatureUnit;
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::window::utc_to_local;
use crate::models::{
    AvailabilityBounds, DeviceOwner, FilterKind, MetricsFilter, NoDataInWindow, QueryOutcome,
    QueryWindow, ResolvedWindow, SearchField,
};
use crate::services::connector::TunnelConnector;
use crate::services::normalize::Normalizer;
use crate::services::source::{FetchRequest, MetricsSource, RowFilter};

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::sync::Arc;

/// Text sink for operator-facing messages.
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: forwards to `tracing` under the `tubscope::operator` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&self, message: &str) {
        tracing::info!(target: "tubscope::operator", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "tubscope::operator", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "tubscope::operator", "{message}");
    }
}

/// Knobs the orchestrator reads from configuration.
#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub reference_zone: Tz,
    pub temperature_unit: TemperatureUnit,
    pub row_limit: usize,
}

/// Where the orchestrator gets its source from.
enum SourceHandle {
    /// The connector's live engine, looked up per call.
    Connector(Arc<TunnelConnector>),
    /// A fixed source.
    Fixed(Arc<dyn MetricsSource>),
}

/// Availability remembered from the most recent query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastAvailability {
    pub filter: MetricsFilter,
    pub bounds: AvailabilityBounds,
}

/// Turns query windows into [`QueryOutcome`]s.
pub struct QueryOrchestrator {
    source: SourceHandle,
    settings: QuerySettings,
    normalizer: Normalizer,
    sink: Arc<dyn LogSink>,
    last_availability: RwLock<Option<LastAvailability>>,
}

impl QueryOrchestrator {
    /// Orchestrator reading through the connector's session. It never connects
    /// or disconnects on its own.
    pub fn new(connector: Arc<TunnelConnector>, settings: QuerySettings) -> Self {
        Self::build(SourceHandle::Connector(connector), settings)
    }

    /// Orchestrator over a fixed source.
    pub fn with_source(source: Arc<dyn MetricsSource>, settings: QuerySettings) -> Self {
        Self::build(SourceHandle::Fixed(source), settings)
    }

    fn build(source: SourceHandle, settings: QuerySettings) -> Self {
        Self {
            source,
            normalizer: Normalizer::new(settings.reference_zone, settings.temperature_unit),
            settings,
            sink: Arc::new(TracingSink),
            last_availability: RwLock::new(None),
        }
    }

    /// Replace the operator sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.set_sink(sink);
        self
    }

    pub fn set_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sink = sink;
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Run a query selecting every column.
    pub async fn run(&self, window: &QueryWindow) -> QueryOutcome {
        self.run_with_columns(window, None).await
    }

    /// Run a query with an optional column projection. The timestamp column is
    /// always included.
    pub async fn run_with_columns(
        &self,
        window: &QueryWindow,
        columns: Option<Vec<String>>,
    ) -> QueryOutcome {
        let resolved = match window.resolve_in(self.settings.reference_zone) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.sink.error(&e.to_string());
                return QueryOutcome::Failed(e);
            }
        };

        match self.run_resolved(&resolved, columns).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(filter = %resolved.filter, error = %e, "Query failed");
                self.sink.error(&format!("Query for {} failed: {e}", resolved.filter));
                QueryOutcome::Failed(e)
            }
        }
    }

    /// Run against an already resolved window.
    pub async fn run_resolved(
        &self,
        window: &ResolvedWindow,
        columns: Option<Vec<String>>,
    ) -> TubscopeResult<QueryOutcome> {
        let source = self.source().await?;
        let tz = self.settings.reference_zone;
        let (start_utc, end_utc) = window.utc_bounds(tz);

        tracing::debug!(
            filter = %window.filter,
            start = %window.start,
            end = %window.end,
            start_utc = %start_utc,
            end_utc = %end_utc,
            "Running query"
        );

        let Some(row_filter) = self.row_filter(source.as_ref(), &window.filter).await? else {
            self.sink.warn(&format!("No devices found for {}", window.filter));
            return Ok(self.empty(window, AvailabilityBounds::default()));
        };

        if !source.exists(&row_filter, start_utc, end_utc).await? {
            let bounds = self.fallback_bounds(source.as_ref(), &row_filter, start_utc, end_utc).await?;
            return Ok(self.empty(window, bounds));
        }

        let (earliest, latest) = source.bounds(&row_filter).await?;
        self.remember(
            &window.filter,
            AvailabilityBounds {
                earliest: earliest.map(|ts| utc_to_local(tz, ts)),
                latest: latest.map(|ts| utc_to_local(tz, ts)),
                ..Default::default()
            },
        );

        let request = FetchRequest {
            filter: row_filter.clone(),
            start: start_utc,
            end: end_utc,
            columns,
            limit: self.settings.row_limit,
        };
        let raw = source.fetch(&request).await?;
        let fetched = raw.row_count();
        if fetched >= self.settings.row_limit {
            self.sink.warn(&format!(
                "Result truncated at {} rows; narrow the window to see the rest",
                self.settings.row_limit
            ));
        }

        let rows = self.normalizer.normalize(raw)?;
        if rows.is_empty() {
            let bounds = self.fallback_bounds(source.as_ref(), &row_filter, start_utc, end_utc).await?;
            return Ok(self.empty(window, bounds));
        }

        tracing::info!(filter = %window.filter, fetched, rows = rows.row_count(), "Query complete");
        self.sink.info(&format!("Fetched {} rows for {}", rows.row_count(), window.filter));
        Ok(QueryOutcome::Found(rows))
    }

    /// `(earliest, latest)` and nearest rows from the most recent query.
    pub fn availability(&self) -> Option<LastAvailability> {
        self.last_availability.read().clone()
    }

    /// Look up device owners by a substring of `field`.
    pub async fn search(&self, field: SearchField, needle: &str) -> TubscopeResult<Vec<DeviceOwner>> {
        if needle.trim().is_empty() {
            return Err(TubscopeError::query("a search term is required"));
        }
        let source = self.source().await?;
        let owners = source.search_owners(field, needle).await?;
        tracing::debug!(field = field.as_str(), matches = owners.len(), "Owner search complete");
        Ok(owners)
    }

    /// Force tunnel and pool setup with a throwaway query. Never fails.
    pub async fn warm_up(&self) {
        let result = match self.source().await {
            Ok(source) => source.warm_up().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!("Warm-up complete"),
            Err(e) => {
                tracing::warn!(error = %e, "Warm-up failed");
                self.sink.warn(&format!("Warm-up failed: {e}"));
            }
        }
    }

    async fn source(&self) -> TubscopeResult<Arc<dyn MetricsSource>> {
        match &self.source {
            SourceHandle::Connector(connector) => connector.source().await,
            SourceHandle::Fixed(source) => Ok(Arc::clone(source)),
        }
    }

    /// `None` when an `esp_ble_id` owns no devices.
    async fn row_filter(
        &self,
        source: &dyn MetricsSource,
        filter: &MetricsFilter,
    ) -> TubscopeResult<Option<RowFilter>> {
        let row_filter = match filter.kind {
            FilterKind::DeviceName => RowFilter::Device(filter.value.clone()),
            FilterKind::UserId => RowFilter::User(filter.value.clone()),
            FilterKind::EspBleId => {
                let devices = source.resolve_device_names(&filter.value).await?;
                tracing::debug!(esp_ble_id = %filter.value, devices = ?devices, "Resolved devices");
                if devices.is_empty() {
                    return Ok(None);
                }
                RowFilter::Devices(devices)
            }
        };
        Ok(Some(row_filter))
    }

    /// Whole-history bounds and the nearest rows around the window, in the reference zone.
    async fn fallback_bounds(
        &self,
        source: &dyn MetricsSource,
        filter: &RowFilter,
        start_utc: NaiveDateTime,
        end_utc: NaiveDateTime,
    ) -> TubscopeResult<AvailabilityBounds> {
        let (earliest, latest) = source.bounds(filter).await?;
        if earliest.is_none() && latest.is_none() {
            return Ok(AvailabilityBounds::default());
        }

        let nearest_before = source.nearest_before(filter, start_utc).await?;
        let nearest_after = source.nearest_after(filter, end_utc).await?;

        let tz = self.settings.reference_zone;
        let local = |ts: Option<NaiveDateTime>| ts.map(|ts| utc_to_local(tz, ts));
        Ok(AvailabilityBounds {
            earliest: local(earliest),
            latest: local(latest),
            nearest_before: local(nearest_before),
            nearest_after: local(nearest_after),
        })
    }

    fn empty(&self, window: &ResolvedWindow, bounds: AvailabilityBounds) -> QueryOutcome {
        self.remember(&window.filter, bounds);
        let empty = NoDataInWindow::new(window.filter.clone(), window.start, window.end, bounds);

        tracing::info!(
            filter = %window.filter,
            earliest = ?bounds.earliest,
            latest = ?bounds.latest,
            "No data points in this time range"
        );
        self.sink.info(&empty.to_string());
        if let Some(detail) = empty.detail() {
            self.sink.info(&detail);
        }
        QueryOutcome::Empty(empty)
    }

    fn remember(&self, filter: &MetricsFilter, bounds: AvailabilityBounds) {
        *self.last_availability.write() = Some(LastAvailability { filter: filter.clone(), bounds });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ResultSet, Value};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use chrono_tz::America::Los_Angeles;

    /// In-memory metrics table. Columns start with `updated_at, device_name, user_id`.
    pub(crate) struct MemorySource {
        pub columns: Vec<String>,
        pub rows: Vec<Vec<Value>>,
        /// `(esp_ble_id, device_name)` pairs.
        pub owners: Vec<(String, String)>,
        pub fail_warm_up: bool,
    }

    impl MemorySource {
        pub(crate) fn new(extra_columns: &[&str]) -> Self {
            let mut columns: Vec<String> =
                vec!["updated_at".into(), "device_name".into(), "user_id".into()];
            columns.extend(extra_columns.iter().map(|c| c.to_string()));
            Self { columns, rows: Vec::new(), owners: Vec::new(), fail_warm_up: false }
        }

        /// Add a row at a UTC instant.
        pub(crate) fn push(&mut self, device: &str, user: &str, utc: NaiveDateTime, extra: Vec<Value>) {
            let mut row = vec![Value::Timestamp(utc), Value::Text(device.into()), Value::Text(user.into())];
            row.extend(extra);
            self.rows.push(row);
        }

        fn matching<'a>(&'a self, filter: &'a RowFilter) -> impl Iterator<Item = NaiveDateTime> + 'a {
            self.rows.iter().filter(move |row| matches(filter, row)).filter_map(|row| row[0].as_timestamp())
        }
    }

    fn matches(filter: &RowFilter, row: &[Value]) -> bool {
        let device = row[1].as_str().unwrap_or_default();
        match filter {
            RowFilter::Device(name) => device == name,
            RowFilter::User(user) => row[2].as_str() == Some(user.as_str()),
            RowFilter::Devices(names) => names.iter().any(|n| n == device),
        }
    }

    #[async_trait]
    impl MetricsSource for MemorySource {
        async fn exists(
            &self,
            filter: &RowFilter,
            start: NaiveDateTime,
            end: NaiveDateTime,
        ) -> TubscopeResult<bool> {
            Ok(self.matching(filter).any(|ts| ts >= start && ts <= end))
        }

        async fn bounds(
            &self,
            filter: &RowFilter,
        ) -> TubscopeResult<(Option<NaiveDateTime>, Option<NaiveDateTime>)> {
            Ok((self.matching(filter).min(), self.matching(filter).max()))
        }

        async fn nearest_before(
            &self,
            filter: &RowFilter,
            before: NaiveDateTime,
        ) -> TubscopeResult<Option<NaiveDateTime>> {
            Ok(self.matching(filter).filter(|ts| *ts < before).max())
        }

        async fn nearest_after(
            &self,
            filter: &RowFilter,
            after: NaiveDateTime,
        ) -> TubscopeResult<Option<NaiveDateTime>> {
            Ok(self.matching(filter).filter(|ts| *ts > after).min())
        }

        async fn fetch(&self, request: &FetchRequest) -> TubscopeResult<ResultSet> {
            let mut rows: Vec<Vec<Value>> = self
                .rows
                .iter()
                .filter(|row| matches(&request.filter, row))
                .filter(|row| {
                    row[0].as_timestamp().is_some_and(|ts| ts >= request.start && ts <= request.end)
                })
                .cloned()
                .collect();
            rows.sort_by_key(|row| row[0].as_timestamp());
            rows.truncate(request.limit);

            let Some(wanted) = &request.columns else {
                return Ok(ResultSet::new(self.columns.clone(), rows));
            };
            let mut indices = vec![0];
            indices.extend(
                wanted.iter().filter_map(|w| self.columns.iter().position(|c| c == w)).filter(|i| *i != 0),
            );
            let columns = indices.iter().map(|i| self.columns[*i].clone()).collect();
            let rows = rows.into_iter().map(|row| indices.iter().map(|i| row[*i].clone()).collect()).collect();
            Ok(ResultSet::new(columns, rows))
        }

        async fn resolve_device_names(&self, esp_ble_id: &str) -> TubscopeResult<Vec<String>> {
            Ok(self
                .owners
                .iter()
                .filter(|(esp, _)| esp == esp_ble_id)
                .map(|(_, device)| device.clone())
                .collect())
        }

        async fn search_owners(
            &self,
            _field: SearchField,
            needle: &str,
        ) -> TubscopeResult<Vec<DeviceOwner>> {
            Ok(self
                .owners
                .iter()
                .filter(|(esp, _)| esp.contains(needle))
                .map(|(esp, device)| DeviceOwner {
                    user_id: device.clone(),
                    full_name: device.clone(),
                    esp_ble_id: Some(esp.clone()),
                })
                .collect())
        }

        async fn warm_up(&self) -> TubscopeResult<()> {
            if self.fail_warm_up {
                Err(TubscopeError::connection("warm-up refused"))
            } else {
                Ok(())
            }
        }
    }

    /// Collects sink messages.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub messages: parking_lot::Mutex<Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn info(&self, message: &str) {
            self.messages.lock().push(format!("info: {message}"));
        }
        fn warn(&self, message: &str) {
            self.messages.lock().push(format!("warn: {message}"));
        }
        fn error(&self, message: &str) {
            self.messages.lock().push(format!("error: {message}"));
        }
    }

    pub(crate) fn settings() -> QuerySettings {
        QuerySettings {
            reference_zone: Los_Angeles,
            temperature_unit: TemperatureUnit::Fahrenheit,
            row_limit: 30_000,
        }
    }

    pub(crate) fn utc(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn orchestrator(source: MemorySource) -> QueryOrchestrator {
        QueryOrchestrator::with_source(Arc::new(source), settings())
    }

    #[tokio::test]
    async fn test_found_rows_are_normalized_in_reference_zone() {
        let mut source = MemorySource::new(&["fan_tach_rpm"]);
        // 2024-01-10 20:00 UTC is 12:00 PST on the 10th.
        source.push("tub-1", "u1", utc(2024, 1, 10, 20), vec![Value::Int(500)]);
        source.push("tub-1", "u1", utc(2024, 1, 10, 18), vec![Value::Int(400)]);
        source.push("tub-2", "u2", utc(2024, 1, 10, 19), vec![Value::Int(1)]);

        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-01-10", "");
        let rows = orchestrator(source).run(&window).await.into_result().unwrap();

        assert_eq!(rows.row_count(), 2);
        let ts = rows.timestamps();
        assert_eq!(ts[0].to_string(), "2024-01-10 10:00:00");
        assert_eq!(ts[1].to_string(), "2024-01-10 12:00:00");
        assert_eq!(rows.value(0, "fan_tach_rpm"), Some(&Value::Float(4.0)));
    }

    #[tokio::test]
    async fn test_window_edges_follow_reference_zone() {
        let mut source = MemorySource::new(&[]);
        // 07:00 UTC on the 11th is still 23:00 PST on the 10th.
        source.push("tub-1", "u1", utc(2024, 1, 11, 7), vec![]);
        // 08:00 UTC on the 10th is midnight PST.
        source.push("tub-1", "u1", utc(2024, 1, 10, 8), vec![]);
        // 07:00 UTC on the 10th belongs to the 9th.
        source.push("tub-1", "u1", utc(2024, 1, 10, 7), vec![]);

        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-01-10", "2024-01-10");
        let rows = orchestrator(source).run(&window).await.into_result().unwrap();
        assert_eq!(rows.row_count(), 2);
    }

    #[tokio::test]
    async fn test_esp_filter_resolves_devices() {
        let mut source = MemorySource::new(&[]);
        source.owners.push(("esp-9".into(), "tub-9".into()));
        source.push("tub-9", "u9", utc(2024, 3, 1, 20), vec![]);
        source.push("tub-1", "u1", utc(2024, 3, 1, 20), vec![]);

        let window = QueryWindow::new(MetricsFilter::esp_ble_id("esp-9"), "2024-03-01", "");
        let rows = orchestrator(source).run(&window).await.into_result().unwrap();
        assert_eq!(rows.row_count(), 1);
        assert_eq!(rows.value(0, "device_name"), Some(&Value::Text("tub-9".into())));
    }

    #[tokio::test]
    async fn test_unknown_esp_has_no_history() {
        let source = MemorySource::new(&[]);
        let window = QueryWindow::new(MetricsFilter::esp_ble_id("nobody"), "2024-03-01", "");
        match orchestrator(source).run(&window).await {
            QueryOutcome::Empty(empty) => assert!(!empty.has_history()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_miss_reports_nearest_rows_on_both_sides() {
        let mut source = MemorySource::new(&[]);
        source.push("tub-1", "u1", utc(2024, 2, 1, 20), vec![]);
        source.push("tub-1", "u1", utc(2024, 2, 20, 20), vec![]);
        source.push("tub-1", "u1", utc(2024, 3, 20, 20), vec![]);

        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(source).with_sink(sink.clone());
        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-02-10", "2024-02-12");

        let empty = match orch.run(&window).await {
            QueryOutcome::Empty(empty) => empty,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(empty.earliest, Some(utc(2024, 2, 1, 12)));
        assert_eq!(empty.latest, Some(utc(2024, 3, 20, 13)));
        assert_eq!(empty.nearest_before, Some(utc(2024, 2, 1, 12)));
        assert_eq!(empty.nearest_after, Some(utc(2024, 2, 20, 12)));

        let last = orch.availability().unwrap();
        assert_eq!(last.filter, MetricsFilter::device("tub-1"));
        assert_eq!(last.bounds.range(), (empty.earliest, empty.latest));

        let messages = sink.messages.lock();
        assert!(messages.iter().any(|m| m.starts_with("info: No data in requested window")));
    }

    #[tokio::test]
    async fn test_invalid_window_fails_without_touching_source() {
        let source = MemorySource::new(&[]);
        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-02-12", "2024-02-10");
        match orchestrator(source).run(&window).await {
            QueryOutcome::Failed(TubscopeError::InvalidWindow { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_projection_keeps_timestamp() {
        let mut source = MemorySource::new(&["water_temp_c", "ph"]);
        source.push("tub-1", "u1", utc(2024, 1, 10, 20), vec![Value::Int(100), Value::Float(7.2)]);

        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-01-10", "");
        let rows = orchestrator(source)
            .run_with_columns(&window, Some(vec!["water_temp_c".into()]))
            .await
            .into_result()
            .unwrap();
        assert_eq!(rows.columns, vec!["updated_at", "water_temp_f"]);
        assert_eq!(rows.value(0, "water_temp_f"), Some(&Value::Float(212.0)));
    }

    #[tokio::test]
    async fn test_found_updates_availability() {
        let mut source = MemorySource::new(&[]);
        source.push("tub-1", "u1", utc(2024, 1, 1, 20), vec![]);
        source.push("tub-1", "u1", utc(2024, 1, 10, 20), vec![]);
        let orch = orchestrator(source);
        assert!(orch.availability().is_none());

        let window = QueryWindow::new(MetricsFilter::device("tub-1"), "2024-01-10", "");
        assert!(orch.run(&window).await.is_found());
        let last = orch.availability().unwrap();
        assert_eq!(last.bounds.earliest, Some(utc(2024, 1, 1, 12)));
        assert_eq!(last.bounds.latest, Some(utc(2024, 1, 10, 12)));
    }

    #[tokio::test]
    async fn test_warm_up_failure_is_swallowed() {
        let mut source = MemorySource::new(&[]);
        source.fail_warm_up = true;
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(source).with_sink(sink.clone());
        orch.warm_up().await;
        assert!(sink.messages.lock().iter().any(|m| m.starts_with("warn: Warm-up failed")));
    }

    #[tokio::test]
    async fn test_search_requires_term() {
        let orch = orchestrator(MemorySource::new(&[]));
        assert!(orch.search(SearchField::FullName, "  ").await.is_err());
        assert!(orch.search(SearchField::FullName, "x").await.unwrap().is_empty());
    }
}
