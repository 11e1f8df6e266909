//! Error types for Tubscope.
//!
//! Every failure that crosses the core's boundary is a [`TubscopeError`]. Missing
//! data inside a query window is deliberately *not* only an error: the query layer
//! reports it as [`crate::models::QueryOutcome::Empty`] and callers convert it into
//! [`TubscopeError::NoDataInWindow`] only when they want to treat it as one.

use crate::models::{CredentialKey, NoDataInWindow};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type TubscopeResult<T> = Result<T, TubscopeError>;

/// Main error type for Tubscope.
#[derive(Debug, Error)]
pub enum TubscopeError {
    /// SSH or database transport could not be established.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The SSH host or the database rejected the supplied credentials.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// SSH protocol or channel error.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Required credential fields are still empty after collection.
    #[error("Missing credentials: {}", join_keys(keys))]
    MissingCredentials {
        /// Keys that have no value.
        keys: Vec<CredentialKey>,
    },

    /// A credential value is present but unusable (e.g. a non-numeric port).
    #[error("Invalid credential {key}: {message}")]
    InvalidCredential {
        /// Offending key.
        key: CredentialKey,
        /// Why the value was rejected.
        message: String,
    },

    /// The operator dismissed the credential prompt.
    #[error("Connection cancelled")]
    ConnectionCancelled,

    /// An operation needed a live session but the connector is disconnected.
    #[error("Not connected")]
    NotConnected,

    /// The requested calendar window is invalid.
    #[error("Invalid window: {message}")]
    InvalidWindow {
        /// Description of what is wrong with the window.
        message: String,
    },

    /// The window holds no rows for the filter.
    #[error("{0}")]
    NoDataInWindow(NoDataInWindow),

    /// A result set lacked a column the normalizer cannot do without.
    #[error("Required column '{column}' missing (columns present: {})", present.join(", "))]
    RequiredColumnMissing {
        /// Canonical name of the missing column.
        column: String,
        /// Columns that were present.
        present: Vec<String>,
    },

    /// The database reported an error for a statement.
    #[error("Query error: {message}")]
    Query {
        /// MySQL error message.
        message: String,
        /// MySQL error code (e.g. 1146).
        code: Option<u16>,
        /// SQLSTATE (e.g. "42S02").
        state: Option<String>,
    },

    /// OS keychain error.
    #[error("Keyring error: {message}")]
    Keyring {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Local file storage error (config, file secret store).
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

fn join_keys(keys: &[CredentialKey]) -> String {
    keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

impl TubscopeError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check SSH_USER and SSH_PASSWORD".to_string()),
        }
    }

    /// Create a new authentication error with custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), source: None }
    }

    /// Create a new SSH error with source.
    pub fn ssh_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssh { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a missing-credentials error.
    pub fn missing_credentials(keys: Vec<CredentialKey>) -> Self {
        Self::MissingCredentials { keys }
    }

    /// Create an invalid-credential error.
    pub fn invalid_credential(key: CredentialKey, message: impl Into<String>) -> Self {
        Self::InvalidCredential { key, message: message.into() }
    }

    /// Create an invalid-window error.
    pub fn invalid_window(message: impl Into<String>) -> Self {
        Self::InvalidWindow { message: message.into() }
    }

    /// Create a required-column error.
    pub fn required_column_missing(column: impl Into<String>, present: Vec<String>) -> Self {
        Self::RequiredColumnMissing { column: column.into(), present }
    }

    /// Create a query error without server details.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), code: None, state: None }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a new keyring error.
    pub fn keyring(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Keyring { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Whether the operator cancelled the credential prompt.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ConnectionCancelled)
    }

    /// Whether the error describes an empty window rather than a failure.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoDataInWindow(_))
    }

    /// Whether retrying `connect()` after fixing credentials can succeed.
    pub fn is_credential_problem(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::MissingCredentials { .. }
                | Self::InvalidCredential { .. }
        )
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Ssh { .. } => "SSH",
            Self::MissingCredentials { .. } => "Credentials",
            Self::InvalidCredential { .. } => "Credentials",
            Self::ConnectionCancelled => "Connection",
            Self::NotConnected => "Connection",
            Self::InvalidWindow { .. } => "Window",
            Self::NoDataInWindow(_) => "No Data",
            Self::RequiredColumnMissing { .. } => "Result",
            Self::Query { .. } => "Query",
            Self::Keyring { .. } => "Keyring",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the SSH host is reachable"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Ssh { .. } => Some("The SSH server may not allow TCP forwarding"),
            Self::MissingCredentials { .. } => Some("Run `tubscope credentials set`"),
            Self::InvalidCredential { .. } => Some("Ports must be numbers between 1 and 65535"),
            Self::ConnectionCancelled => None,
            Self::NotConnected => Some("Connect before running queries"),
            Self::InvalidWindow { .. } => Some("Use YYYY-MM-DD dates at most 7 days apart"),
            Self::NoDataInWindow(_) => Some("Pick a window inside the available range"),
            Self::RequiredColumnMissing { .. } => Some("Check the metrics table schema"),
            Self::Query { .. } => None,
            Self::Keyring { hint, .. } => hint.as_deref(),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { code, state, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(state) = state {
                    parts.push(format!("SQLSTATE: {state}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::NoDataInWindow(empty) => empty.detail(),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for a "details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from mysql_async::Error to TubscopeError.
impl From<mysql_async::Error> for TubscopeError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => {
                // 1045: access denied
                if server.code == 1045 {
                    return TubscopeError::authentication_with_hint(
                        server.message,
                        "Check MYSQL_USER and MYSQL_PASSWORD",
                    );
                }
                TubscopeError::Query {
                    message: server.message,
                    code: Some(server.code),
                    state: Some(server.state),
                }
            }
            mysql_async::Error::Io(io) => TubscopeError::connection_with_source(
                format!("Database I/O failure: {io}"),
                io,
            ),
            mysql_async::Error::Driver(driver) => {
                TubscopeError::connection(format!("Database driver error: {driver}"))
            }
            other => TubscopeError::Query { message: other.to_string(), code: None, state: None },
        }
    }
}

/// Convert from russh::Error to TubscopeError.
impl From<russh::Error> for TubscopeError {
    fn from(err: russh::Error) -> Self {
        TubscopeError::ssh_with_source(err.to_string(), err)
    }
}

/// Convert from std::io::Error to TubscopeError.
impl From<std::io::Error> for TubscopeError {
    fn from(err: std::io::Error) -> Self {
        TubscopeError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to TubscopeError.
impl From<serde_json::Error> for TubscopeError {
    fn from(err: serde_json::Error) -> Self {
        TubscopeError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from keyring::Error to TubscopeError.
impl From<keyring::Error> for TubscopeError {
    fn from(err: keyring::Error) -> Self {
        TubscopeError::Keyring {
            message: err.to_string(),
            hint: Some("Grant Tubscope access in system preferences".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_lists_keys() {
        let err = TubscopeError::missing_credentials(vec![
            CredentialKey::SshHost,
            CredentialKey::MysqlPassword,
        ]);
        let msg = err.to_string();
        assert!(msg.contains("SSH_HOST"));
        assert!(msg.contains("MYSQL_PASSWORD"));
        assert!(err.is_credential_problem());
    }

    #[test]
    fn test_required_column_names_present_columns() {
        let err = TubscopeError::required_column_missing(
            "updated_at",
            vec!["device_name".to_string(), "fan_tach_rpm".to_string()],
        );
        let msg = err.to_string();
        assert!(msg.contains("updated_at"));
        assert!(msg.contains("device_name, fan_tach_rpm"));
        assert_eq!(err.category(), "Result");
    }

    #[test]
    fn test_error_info_has_hint() {
        let info = TubscopeError::invalid_window("end before start").to_error_info();
        assert_eq!(info.error_type, "Window Error");
        assert!(info.hint.is_some());
        assert!(info.message.contains("end before start"));
    }

    #[test]
    fn test_cancelled_is_not_credential_problem() {
        let err = TubscopeError::ConnectionCancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_credential_problem());
    }
}
