//! Core types and services for Tubscope.
//!
//! Tubscope inspects a device-telemetry store that is only reachable through an
//! SSH-gated host. This crate provides:
//!
//! - **error**: Error handling with categories and actionable hints
//! - **models**: Credentials, windows, filters, result sets and outcomes
//! - **services**: SSH tunnel, connector, metrics engine, query orchestration
//! - **config**: Persistent configuration and the data directory
//! - **state**: Application state management
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;


pub use config::{AppConfig, SchemaConfig, TemperatureUnit};
pub use error::{ErrorInfo, TubscopeError, TubscopeResult};
pub use models::{
    AvailabilityBounds, ConnectOutcome, ConnectionOptions, ConnectionState, CredentialKey,
    Credentials, DeviceOwner, FilterKind, MetricsFilter, NoDataInWindow, QueryOutcome,
    QueryWindow, ResolvedWindow, ResultSet, SearchField, Value,
};
pub use services::{
    CredentialPrompt, CredentialService, LogSink, MetricsSource, PromptOutcome, QueryOrchestrator,
    SecretStore, TunnelConnector, TunnelForwarder,
};
pub use state::AppState;
