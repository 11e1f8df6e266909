//! Data models for Tubscope.
//!
//! - `credentials` - Credentials and the keys they are stored under
//! - `connection` - Connector lifecycle state and tuning options
//! - `filter` - Metric filters
//! - `window` - Calendar windows in the reference time zone
//! - `result` - Result sets, availability bounds, query outcomes
//! - `search` - Device-owner lookup

pub mod connection;
pub mod credentials;
pub mod filter;
pub mod result;
pub mod search;
pub mod window;

pub use connection::{ConnectOutcome, ConnectionOptions, ConnectionState};
pub use credentials::{CredentialKey, Credentials};
pub use filter::{FilterKind, MetricsFilter};
pub use result::{
    AvailabilityBounds, NoDataInWindow, QueryOutcome, ResultSet, Value, TIMESTAMP_COLUMN,
};
pub use search::{DeviceOwner, SearchField};
pub use window::{QueryWindow, ResolvedWindow, MAX_WINDOW_DAYS};
