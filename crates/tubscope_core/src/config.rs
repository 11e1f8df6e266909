//! Application configuration and data directory.
//!
//! Configuration lives in `<data_dir>/config.json`. A missing or unreadable file
//! yields defaults; nothing in here is secret (credentials go to the secret store).
//!
//! # Data Directory Locations
//!
//! - **macOS**: `~/Library/Application Support/dev.tubscope.Tubscope`
//! - **Windows**: `%APPDATA%\tubscope\Tubscope`
//! - **Linux**: `~/.local/share/tubscope`
//! - **Debug builds**: `./tubscope_data` in current directory

use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{ConnectionOptions, QueryWindow};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Service name the secret store files credentials under.
pub const DEFAULT_SECRET_SERVICE: &str = "PlungeTubApp";

/// Rows returned by one fetch at most.
pub const DEFAULT_ROW_LIMIT: usize = 30_000;

/// Get the default data directory for the application.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./tubscope_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| {
                #[cfg(target_os = "macos")]
                {
                    d.join("dev.tubscope.Tubscope")
                }
                #[cfg(target_os = "windows")]
                {
                    d.join("tubscope").join("Tubscope")
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    d.join("tubscope")
                }
            })
            .unwrap_or_else(|| PathBuf::from("./tubscope_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> TubscopeResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(TubscopeError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    fs::create_dir_all(path).map_err(|e| {
        TubscopeError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// Unit temperature columns are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    /// Keep `*_temp_c` columns as stored.
    Celsius,
    /// Replace `*_temp_c` columns with `*_temp_f`.
    #[default]
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "c" | "celsius" => Some(Self::Celsius),
            "f" | "fahrenheit" => Some(Self::Fahrenheit),
            _ => None,
        }
    }
}

/// Table and column names of the remote schema.
///
/// These are spliced into SQL as identifiers, so [`SchemaConfig::validate`] only
/// admits `[A-Za-z0-9_]` segments joined by dots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub metrics_table: String,
    pub timestamp_column: String,
    pub device_column: String,
    pub user_column: String,
    pub ownership_table: String,
    pub ownership_device_id_column: String,
    pub ownership_user_column: String,
    pub profile_table: String,
    pub profile_user_column: String,
    pub profile_name_column: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            metrics_table: "cp_device_metrics".to_string(),
            timestamp_column: "updated_at".to_string(),
            device_column: "device_name".to_string(),
            user_column: "user_id".to_string(),
            ownership_table: "cpdevdb.user_cp_devices".to_string(),
            ownership_device_id_column: "esp_ble_id".to_string(),
            ownership_user_column: "user_id".to_string(),
            profile_table: "cpdevdb.user_profile".to_string(),
            profile_user_column: "user_id".to_string(),
            profile_name_column: "full_name".to_string(),
        }
    }
}

impl SchemaConfig {
    pub fn validate(&self) -> TubscopeResult<()> {
        let names = [
            ("metrics_table", &self.metrics_table),
            ("timestamp_column", &self.timestamp_column),
            ("device_column", &self.device_column),
            ("user_column", &self.user_column),
            ("ownership_table", &self.ownership_table),
            ("ownership_device_id_column", &self.ownership_device_id_column),
            ("ownership_user_column", &self.ownership_user_column),
            ("profile_table", &self.profile_table),
            ("profile_user_column", &self.profile_user_column),
            ("profile_name_column", &self.profile_name_column),
        ];
        for (field, name) in names {
            if !is_sql_identifier(name) {
                return Err(TubscopeError::config(format!(
                    "schema.{field} '{name}' is not a valid SQL identifier"
                )));
            }
        }
        Ok(())
    }
}

/// `name` or `schema.name`, each segment `[A-Za-z0-9_]+`.
pub fn is_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Persistent application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Civil time zone windows are entered in and results are reported in
    pub reference_timezone: Tz,
    /// Unit for temperature columns
    pub temperature_unit: TemperatureUnit,
    /// Row cap for one fetch
    pub row_limit: usize,
    /// Service name for the secret store
    pub secret_service: String,
    /// Remote schema names
    pub schema: SchemaConfig,
    /// Timeouts and pool tuning
    pub connection: ConnectionOptions,
    /// Last query the operator ran, for prefilling
    pub last_query: Option<QueryWindow>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reference_timezone: chrono_tz::America::Los_Angeles,
            temperature_unit: TemperatureUnit::default(),
            row_limit: DEFAULT_ROW_LIMIT,
            secret_service: DEFAULT_SECRET_SERVICE.to_string(),
            schema: SchemaConfig::default(),
            connection: ConnectionOptions::default(),
            last_query: None,
        }
    }
}

impl AppConfig {
    /// Path of the config file inside `data_dir`.
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Load from `path`, falling back to defaults if missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }

        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                Self::default()
            }
        }
    }

    /// Load from `path`, reporting parse and validation errors.
    pub fn try_load(path: &Path) -> TubscopeResult<Self> {
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> TubscopeResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                init_data_dir(parent)?;
            }
        }
        let json = self.to_json_pretty()?;
        fs::write(path, json).map_err(|e| {
            TubscopeError::storage(format!("Failed to write config '{}': {e}", path.display()), None)
        })?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn to_json_pretty(&self) -> TubscopeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> TubscopeResult<()> {
        if self.row_limit == 0 {
            return Err(TubscopeError::config("row_limit must be greater than zero"));
        }
        if self.secret_service.trim().is_empty() {
            return Err(TubscopeError::config("secret_service must not be empty"));
        }
        self.schema.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricsFilter;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load(&AppConfig::path_in(dir.path()));
        assert_eq!(config.row_limit, DEFAULT_ROW_LIMIT);
        assert_eq!(config.reference_timezone, chrono_tz::America::Los_Angeles);
        assert_eq!(config.temperature_unit, TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = AppConfig::path_in(dir.path());

        let mut config = AppConfig::default();
        config.temperature_unit = TemperatureUnit::Celsius;
        config.reference_timezone = chrono_tz::Europe::Berlin;
        config.last_query =
            Some(QueryWindow::new(MetricsFilter::device("tub-01"), "2024-01-01", "2024-01-02"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded.temperature_unit, TemperatureUnit::Celsius);
        assert_eq!(loaded.reference_timezone, chrono_tz::Europe::Berlin);
        assert_eq!(loaded.last_query, config.last_query);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = AppConfig::path_in(dir.path());
        fs::write(&path, "{ not json").unwrap();

        assert!(AppConfig::try_load(&path).is_err());
        assert_eq!(AppConfig::load(&path).row_limit, DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = AppConfig::path_in(dir.path());
        fs::write(&path, r#"{"row_limit": 500}"#).unwrap();

        let config = AppConfig::try_load(&path).unwrap();
        assert_eq!(config.row_limit, 500);
        assert_eq!(config.schema, SchemaConfig::default());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_sql_identifier("cp_device_metrics"));
        assert!(is_sql_identifier("cpdevdb.user_profile"));
        assert!(!is_sql_identifier("a.b.c"));
        assert!(!is_sql_identifier("metrics; DROP TABLE x"));
        assert!(!is_sql_identifier(""));

        let mut schema = SchemaConfig::default();
        schema.metrics_table = "bad name".to_string();
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_init_data_dir_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, "x").unwrap();
        assert!(init_data_dir(&file).is_err());
        assert!(init_data_dir(&dir.path().join("fresh")).is_ok());
    }
}
