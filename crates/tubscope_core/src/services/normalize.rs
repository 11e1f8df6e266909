//! Result normalization.
//!
//! Turns a raw fetch into the shape every caller relies on: lower-case column
//! names, a canonical `updated_at` column in reference-zone time, rows in
//! ascending time order, no all-null columns, and display units applied.

use crate::config::TemperatureUnit;
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::window::utc_to_local;
use crate::models::{ResultSet, Value, TIMESTAMP_COLUMN};

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;

/// Header spellings accepted for the timestamp column, in priority order.
pub const TIMESTAMP_ALIASES: &[&str] =
    &["updated_at", "updatedat", "update_at", "timestamp", "ts", "time", "created_at"];

/// Tachometer column stored in hundredths.
pub const TACH_COLUMN: &str = "fan_tach_rpm";

const CELSIUS_SUFFIX: &str = "_temp_c";
const FAHRENHEIT_SUFFIX: &str = "_temp_f";

/// Normalization settings.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub reference_zone: Tz,
    pub temperature_unit: TemperatureUnit,
}

impl Normalizer {
    pub fn new(reference_zone: Tz, temperature_unit: TemperatureUnit) -> Self {
        Self { reference_zone, temperature_unit }
    }

    /// Normalize `raw`. An empty output means every row had an unusable timestamp.
    pub fn normalize(&self, raw: ResultSet) -> TubscopeResult<ResultSet> {
        let ResultSet { columns, rows } = raw;
        let fetched = rows.len();
        let mut columns: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();

        let ts_idx = resolve_timestamp_column(&columns)?;
        columns[ts_idx] = TIMESTAMP_COLUMN.to_string();

        // Parse as UTC, dropping rows that fail.
        let mut rows: Vec<(NaiveDateTime, Vec<Value>)> = rows
            .into_iter()
            .filter_map(|row| {
                let ts = row.get(ts_idx).and_then(parse_utc)?;
                Some((ts, row))
            })
            .collect();
        rows.sort_by_key(|(ts, _)| *ts);

        let mut rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|(ts, mut row)| {
                row[ts_idx] = Value::Timestamp(utc_to_local(self.reference_zone, ts));
                row
            })
            .collect();
        if rows.len() < fetched {
            tracing::debug!(fetched, kept = rows.len(), "Dropped rows with unparseable timestamps");
        }

        drop_all_null_columns(&mut columns, &mut rows);

        if let Some(idx) = columns.iter().position(|c| c == TACH_COLUMN) {
            for row in &mut rows {
                row[idx] = match row[idx].as_f64() {
                    Some(v) => Value::Float(v / 100.0),
                    None => Value::Null,
                };
            }
        }

        if self.temperature_unit == TemperatureUnit::Fahrenheit {
            celsius_to_fahrenheit(&mut columns, &mut rows);
        }

        Ok(ResultSet::new(columns, rows))
    }
}

/// Index of the timestamp column after lower-casing.
fn resolve_timestamp_column(columns: &[String]) -> TubscopeResult<usize> {
    TIMESTAMP_ALIASES
        .iter()
        .find_map(|alias| columns.iter().position(|c| c == alias))
        .ok_or_else(|| TubscopeError::required_column_missing(TIMESTAMP_COLUMN, columns.to_vec()))
}

/// Read a cell as a UTC instant. Offsets in text are honoured; bare text is UTC.
fn parse_utc(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Text(_) | Value::Bytes(_) => {
            let s = value.as_str()?.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.naive_utc());
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%d"]
                .iter()
                .find_map(|fmt| {
                    NaiveDateTime::parse_from_str(s, fmt).ok().or_else(|| {
                        chrono::NaiveDate::parse_from_str(s, fmt)
                            .ok()
                            .map(|d| d.and_time(chrono::NaiveTime::MIN))
                    })
                })
        }
        Value::Null | Value::Int(_) | Value::Float(_) => None,
    }
}

fn drop_all_null_columns(columns: &mut Vec<String>, rows: &mut [Vec<Value>]) {
    if rows.is_empty() {
        return;
    }
    let keep: Vec<bool> = (0..columns.len())
        .map(|idx| rows.iter().any(|row| !row[idx].is_null()))
        .collect();
    if keep.iter().all(|k| *k) {
        return;
    }

    let mut idx = 0;
    columns.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    for row in rows.iter_mut() {
        let mut idx = 0;
        row.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }
}

/// Append `<x>_temp_f` for every `<x>_temp_c` and remove the source columns.
fn celsius_to_fahrenheit(columns: &mut Vec<String>, rows: &mut [Vec<Value>]) {
    let sources: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.ends_with(CELSIUS_SUFFIX))
        .map(|(idx, _)| idx)
        .collect();
    if sources.is_empty() {
        return;
    }

    for &idx in &sources {
        let name = &columns[idx];
        let stem = &name[..name.len() - CELSIUS_SUFFIX.len()];
        columns.push(format!("{stem}{FAHRENHEIT_SUFFIX}"));
    }
    for row in rows.iter_mut() {
        for &idx in &sources {
            let converted = match row[idx].as_f64() {
                Some(c) => Value::Float(round3(c * 9.0 / 5.0 + 32.0)),
                None => Value::Null,
            };
            row.push(converted);
        }
    }

    for &idx in sources.iter().rev() {
        columns.remove(idx);
        for row in rows.iter_mut() {
            row.remove(idx);
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::America::Los_Angeles;

    fn utc(h: u32) -> Value {
        Value::Timestamp(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap().and_hms_opt(h, 0, 0).unwrap())
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(Los_Angeles, TemperatureUnit::Fahrenheit)
    }

    #[test]
    fn test_alias_renamed_and_zone_converted() {
        let raw = ResultSet::new(vec!["Timestamp".into(), "V".into()], vec![vec![utc(16), Value::Int(1)]]);
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.columns, vec!["updated_at", "v"]);
        // 16:00 UTC is 08:00 PST.
        assert_eq!(out.timestamps()[0].to_string(), "2024-01-10 08:00:00");
    }

    #[test]
    fn test_missing_timestamp_names_present_columns() {
        let raw = ResultSet::new(vec!["a".into(), "B".into()], vec![]);
        let err = normalizer().normalize(raw).unwrap_err();
        match err {
            TubscopeError::RequiredColumnMissing { column, present } => {
                assert_eq!(column, "updated_at");
                assert_eq!(present, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_canonical_name_wins_over_alias() {
        let raw = ResultSet::new(
            vec!["time".into(), "updated_at".into()],
            vec![vec![Value::Text("garbage".into()), utc(12)]],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.columns, vec!["time", "updated_at"]);
    }

    #[test]
    fn test_unparseable_rows_dropped_and_sorted() {
        let raw = ResultSet::new(
            vec!["updated_at".into(), "n".into()],
            vec![
                vec![utc(12), Value::Int(2)],
                vec![Value::Text("nope".into()), Value::Int(9)],
                vec![Value::Text("2024-01-10 09:00:00".into()), Value::Int(1)],
                vec![Value::Null, Value::Int(8)],
            ],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.column("n").unwrap(), vec![&Value::Int(1), &Value::Int(2)]);
    }

    #[test]
    fn test_text_with_offset_is_honoured() {
        let raw = ResultSet::new(
            vec!["updated_at".into()],
            vec![vec![Value::Text("2024-01-10T08:00:00-08:00".into())]],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.timestamps()[0].to_string(), "2024-01-10 08:00:00");
    }

    #[test]
    fn test_all_null_columns_dropped() {
        let raw = ResultSet::new(
            vec!["updated_at".into(), "empty".into(), "some".into()],
            vec![vec![utc(1), Value::Null, Value::Null], vec![utc(2), Value::Null, Value::Int(3)]],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.columns, vec!["updated_at", "some"]);
    }

    #[test]
    fn test_tach_scaled() {
        let raw = ResultSet::new(
            vec!["updated_at".into(), "fan_tach_rpm".into()],
            vec![vec![utc(1), Value::Int(1234)]],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.value(0, "fan_tach_rpm"), Some(&Value::Float(12.34)));
    }

    #[test]
    fn test_celsius_replaced_by_fahrenheit() {
        let raw = ResultSet::new(
            vec!["updated_at".into(), "device_temp_c".into(), "water_temp_c".into()],
            vec![vec![utc(1), Value::Int(0), Value::Float(3.3333)]],
        );
        let out = normalizer().normalize(raw).unwrap();
        assert_eq!(out.columns, vec!["updated_at", "device_temp_f", "water_temp_f"]);
        assert_eq!(out.value(0, "device_temp_f"), Some(&Value::Float(32.0)));
        assert_eq!(out.value(0, "water_temp_f"), Some(&Value::Float(38.0)));
    }

    #[test]
    fn test_celsius_unit_keeps_raw_columns() {
        let raw = ResultSet::new(
            vec!["updated_at".into(), "device_temp_c".into()],
            vec![vec![utc(1), Value::Int(20)]],
        );
        let out = Normalizer::new(Los_Angeles, TemperatureUnit::Celsius).normalize(raw).unwrap();
        assert_eq!(out.columns, vec!["updated_at", "device_temp_c"]);
        assert_eq!(out.value(0, "device_temp_c"), Some(&Value::Int(20)));
    }
}
