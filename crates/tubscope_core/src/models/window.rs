//! Calendar query windows in the reference time zone.
//!
//! Users type dates in whatever form they like; a [`QueryWindow`] holds that raw
//! text and [`QueryWindow::resolve`] turns it into a [`ResolvedWindow`] covering
//! whole days, `[00:00:00.000000, 23:59:59.999999]`, in the reference zone. The
//! resolved bounds carry no zone marker. They are converted to UTC only when a
//! statement is bound ([`ResolvedWindow::utc_bounds`]).

use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{FilterKind, MetricsFilter};

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Longest span a single query may cover.
pub const MAX_WINDOW_DAYS: i64 = 7;

/// Years a typed date may fall in.
const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 9999;

/// Formats that carry a year.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%d %b %Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%B %d, %Y",
];

/// Formats without a year; the current year is appended before parsing.
const YEARLESS_FORMATS: &[&str] = &["%m-%d %Y", "%m/%d %Y", "%b %d %Y", "%B %d %Y", "%d %b %Y"];

/// Raw, user-entered window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub filter_kind: FilterKind,
    pub filter_value: String,
    pub start_date: String,
    pub end_date: String,
}

impl QueryWindow {
    pub fn new(
        filter: MetricsFilter,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
    ) -> Self {
        Self {
            filter_kind: filter.kind,
            filter_value: filter.value,
            start_date: start_date.into(),
            end_date: end_date.into(),
        }
    }

    pub fn filter(&self) -> MetricsFilter {
        MetricsFilter::new(self.filter_kind, self.filter_value.clone())
    }

    /// Resolve against `today` (a reference-zone calendar date).
    ///
    /// One blank side copies the other; both blank means `today`.
    pub fn resolve(&self, today: NaiveDate) -> TubscopeResult<ResolvedWindow> {
        let filter = self.filter();
        if filter.value.is_empty() {
            return Err(TubscopeError::invalid_window(format!(
                "a {} value is required",
                filter.kind
            )));
        }

        let start = parse_optional(&self.start_date, today.year())?;
        let end = parse_optional(&self.end_date, today.year())?;

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            (Some(s), None) => (s, s),
            (None, Some(e)) => (e, e),
            (None, None) => (today, today),
        };

        ResolvedWindow::from_dates(filter, start, end)
    }

    /// Resolve using the current date in `tz`.
    pub fn resolve_in(&self, tz: Tz) -> TubscopeResult<ResolvedWindow> {
        self.resolve(today_in(tz))
    }
}

/// A validated whole-day window with zone-less reference-zone bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedWindow {
    pub filter: MetricsFilter,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ResolvedWindow {
    /// Expand two calendar dates to full-day bounds and validate them.
    pub fn from_dates(
        filter: MetricsFilter,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TubscopeResult<Self> {
        let start = day_start(start);
        let end = day_end(end).ok_or_else(|| {
            TubscopeError::invalid_window(format!("{end} is outside the supported date range"))
        })?;

        if end <= start {
            return Err(TubscopeError::invalid_window(format!(
                "end ({}) must be after start ({})",
                end.format("%Y-%m-%d %H:%M:%S"),
                start.format("%Y-%m-%d %H:%M:%S")
            )));
        }
        if end - start > TimeDelta::days(MAX_WINDOW_DAYS) {
            return Err(TubscopeError::invalid_window(format!(
                "window spans {} days; at most {MAX_WINDOW_DAYS} days are allowed",
                (end.date() - start.date()).num_days() + 1
            )));
        }

        Ok(Self { filter, start, end })
    }

    /// Re-expand to whole days and re-validate. Idempotent for resolved windows.
    pub fn normalize(&self) -> TubscopeResult<Self> {
        Self::from_dates(self.filter.clone(), self.start.date(), self.end.date())
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.date()
    }

    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Whether a reference-zone timestamp falls inside the window (inclusive).
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Bounds converted to UTC for binding into SQL.
    pub fn utc_bounds(&self, tz: Tz) -> (NaiveDateTime, NaiveDateTime) {
        (local_to_utc(tz, self.start, Fold::Earliest), local_to_utc(tz, self.end, Fold::Latest))
    }

    /// Back to raw form (dates only).
    pub fn to_query_window(&self) -> QueryWindow {
        QueryWindow::new(
            self.filter.clone(),
            self.start_date().format("%Y-%m-%d").to_string(),
            self.end_date().format("%Y-%m-%d").to_string(),
        )
    }
}

/// Which instant to pick when a local time occurs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Earliest,
    Latest,
}

/// Convert a zone-less reference-zone time to zone-less UTC.
///
/// Times inside a spring-forward gap are shifted forward by the gap.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime, fold: Fold) -> NaiveDateTime {
    let pick = |result: LocalResult<DateTime<Tz>>| match (result, fold) {
        (LocalResult::Single(dt), _) => Some(dt),
        (LocalResult::Ambiguous(early, _), Fold::Earliest) => Some(early),
        (LocalResult::Ambiguous(_, late), Fold::Latest) => Some(late),
        (LocalResult::None, _) => None,
    };

    pick(tz.from_local_datetime(&local))
        .or_else(|| {
            let shifted = local.checked_add_signed(TimeDelta::hours(1))?;
            pick(tz.from_local_datetime(&shifted))
        })
        .map(|dt| dt.naive_utc())
        .unwrap_or(local)
}

/// Convert a zone-less UTC time to zone-less reference-zone time.
pub fn utc_to_local(tz: Tz, utc: NaiveDateTime) -> NaiveDateTime {
    tz.from_utc_datetime(&utc).naive_local()
}

/// Today's calendar date in `tz`.
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// Parse free-form date text. Year-less input takes `default_year`.
pub fn parse_date(text: &str, default_year: i32) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    // Accept full timestamps and keep only their date.
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            let with_year = format!("{text} {default_year}");
            YEARLESS_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(&with_year, fmt).ok())
        })
}

fn parse_optional(text: &str, default_year: i32) -> TubscopeResult<Option<NaiveDate>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let date = parse_date(text, default_year).ok_or_else(|| {
        TubscopeError::invalid_window(format!("cannot read '{}' as a date", text.trim()))
    })?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(TubscopeError::invalid_window(format!(
            "{date} is outside {MIN_YEAR}-{MAX_YEAR}"
        )));
    }
    Ok(Some(date))
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Last microsecond of `date`. `None` past the end of the calendar.
fn day_end(date: NaiveDate) -> Option<NaiveDateTime> {
    day_start(date)
        .checked_add_signed(TimeDelta::days(1))?
        .checked_sub_signed(TimeDelta::microseconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn window(start: &str, end: &str) -> QueryWindow {
        QueryWindow::new(MetricsFilter::device("tub-01"), start, end)
    }

    #[test]
    fn test_out_of_range_year_is_invalid_window() {
        let today = d(2026, 1, 1);
        for text in ["+262142-12-31", "0001-01-01", "12000-01-01"] {
            let err = window(text, "").resolve(today).unwrap_err();
            assert!(matches!(err, TubscopeError::InvalidWindow { .. }), "{text}: {err}");
        }
    }

    #[test]
    fn test_last_calendar_day_does_not_overflow() {
        let err =
            ResolvedWindow::from_dates(MetricsFilter::device("t"), NaiveDate::MAX, NaiveDate::MAX)
                .unwrap_err();
        assert!(matches!(err, TubscopeError::InvalidWindow { .. }));
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!(parse_date("2024-03-05", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("2024/03/05", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("03/05/2024", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("Mar 5 2024", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("March 5, 2024", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("2024-03-05 13:14:15", 2030), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("yesterday-ish", 2030), None);
    }

    #[test]
    fn test_year_omitted_uses_default_year() {
        assert_eq!(parse_date("03-05", 2026), Some(d(2026, 3, 5)));
        assert_eq!(parse_date("3/5", 2026), Some(d(2026, 3, 5)));
        assert_eq!(parse_date("Mar 5", 2026), Some(d(2026, 3, 5)));
    }

    #[test]
    fn test_full_day_expansion() {
        let resolved = window("2024-03-05", "2024-03-06").resolve(d(2026, 1, 1)).unwrap();
        assert_eq!(resolved.start.to_string(), "2024-03-05 00:00:00");
        assert_eq!(resolved.end.to_string(), "2024-03-06 23:59:59.999999");
    }

    #[test]
    fn test_single_side_copies_other() {
        let today = d(2026, 1, 1);
        let only_start = window("2024-03-05", "").resolve(today).unwrap();
        assert_eq!(only_start.start_date(), only_start.end_date());

        let only_end = window("  ", "2024-03-07").resolve(today).unwrap();
        assert_eq!(only_end.start_date(), d(2024, 3, 7));
        assert_eq!(only_end.end_date(), d(2024, 3, 7));
    }

    #[test]
    fn test_blank_defaults_to_today() {
        let today = d(2026, 10, 17);
        let resolved = window("", "").resolve(today).unwrap();
        assert_eq!(resolved.start_date(), today);
        assert_eq!(resolved.end_date(), today);
    }

    #[test]
    fn test_end_before_start_rejected() {
        let err = window("2024-03-06", "2024-03-05").resolve(d(2026, 1, 1)).unwrap_err();
        assert!(matches!(err, TubscopeError::InvalidWindow { .. }));
    }

    #[test]
    fn test_seven_day_limit() {
        let today = d(2026, 1, 1);
        assert!(window("2024-03-01", "2024-03-07").resolve(today).is_ok());
        let err = window("2024-03-01", "2024-03-08").resolve(today).unwrap_err();
        assert!(err.to_string().contains("at most 7 days"));
    }

    #[test]
    fn test_empty_filter_value_rejected() {
        let raw = QueryWindow::new(MetricsFilter::device(""), "2024-03-01", "2024-03-01");
        assert!(raw.resolve(d(2026, 1, 1)).is_err());
    }

    #[test]
    fn test_unparseable_date_rejected() {
        let err = window("someday", "").resolve(d(2026, 1, 1)).unwrap_err();
        assert!(err.to_string().contains("someday"));
    }

    #[test]
    fn test_utc_bounds_in_los_angeles() {
        // PST is UTC-8 in January.
        let resolved = window("2024-01-10", "2024-01-10").resolve(d(2026, 1, 1)).unwrap();
        let (start, end) = resolved.utc_bounds(Los_Angeles);
        assert_eq!(start.to_string(), "2024-01-10 08:00:00");
        assert_eq!(end.to_string(), "2024-01-11 07:59:59.999999");
    }

    #[test]
    fn test_utc_round_trip() {
        let local = d(2024, 7, 1).and_hms_opt(12, 30, 0).unwrap();
        let utc = local_to_utc(Los_Angeles, local, Fold::Earliest);
        assert_eq!(utc_to_local(Los_Angeles, utc), local);
    }

    #[test]
    fn test_spring_forward_gap_is_shifted() {
        // 2024-03-10 02:30 does not exist in Los Angeles.
        let local = d(2024, 3, 10).and_hms_opt(2, 30, 0).unwrap();
        let utc = local_to_utc(Los_Angeles, local, Fold::Earliest);
        assert_eq!(utc.to_string(), "2024-03-10 10:30:00");
    }
}
