//! Metric filters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the metrics query is filtered by.
///
/// The column name of each kind is fixed here and never taken from user input,
/// so it is safe to splice into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Direct match on the metrics table's device column.
    #[default]
    DeviceName,
    /// Direct match on the metrics table's user column.
    UserId,
    /// Secondary identifier; resolved to device names through the ownership table.
    EspBleId,
}

impl FilterKind {
    pub const ALL: [FilterKind; 3] = [Self::DeviceName, Self::UserId, Self::EspBleId];

    /// Identifier as shown to users and stored in config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceName => "device_name",
            Self::UserId => "user_id",
            Self::EspBleId => "esp_ble_id",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "device_name" | "device" => Some(Self::DeviceName),
            "user_id" | "user" => Some(Self::UserId),
            "esp_ble_id" | "esp" | "ble" => Some(Self::EspBleId),
            _ => None,
        }
    }

    /// Whether this kind needs the device-ownership indirection.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::EspBleId)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filter kind together with the value to match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricsFilter {
    pub kind: FilterKind,
    pub value: String,
}

impl MetricsFilter {
    pub fn new(kind: FilterKind, value: impl Into<String>) -> Self {
        Self { kind, value: value.into().trim().to_string() }
    }

    pub fn device(value: impl Into<String>) -> Self {
        Self::new(FilterKind::DeviceName, value)
    }

    pub fn user(value: impl Into<String>) -> Self {
        Self::new(FilterKind::UserId, value)
    }

    pub fn esp_ble_id(value: impl Into<String>) -> Self {
        Self::new(FilterKind::EspBleId, value)
    }
}

impl fmt::Display for MetricsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(FilterKind::parse("device_name"), Some(FilterKind::DeviceName));
        assert_eq!(FilterKind::parse(" USER_ID "), Some(FilterKind::UserId));
        assert_eq!(FilterKind::parse("esp_ble_id"), Some(FilterKind::EspBleId));
        assert_eq!(FilterKind::parse("updated_at; DROP TABLE x"), None);
    }

    #[test]
    fn test_only_esp_is_secondary() {
        assert!(FilterKind::EspBleId.is_secondary());
        assert!(!FilterKind::DeviceName.is_secondary());
        assert!(!FilterKind::UserId.is_secondary());
    }

    #[test]
    fn test_filter_value_is_trimmed() {
        let filter = MetricsFilter::device("  tub-01 ");
        assert_eq!(filter.value, "tub-01");
        assert_eq!(filter.to_string(), "device_name=tub-01");
    }
}
