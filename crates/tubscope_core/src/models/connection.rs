//! Connector lifecycle state and tuning options.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle of the tunnel connector.
///
/// `Disconnected → Connecting → Authenticating → ForwardingUp → Connected →
/// Disconnecting → Disconnected`. A cancelled credential prompt goes straight
/// from `Connecting` back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session exists.
    #[default]
    Disconnected,
    /// Credentials are being resolved.
    Connecting,
    /// SSH handshake and password authentication in progress.
    Authenticating,
    /// Local forwarder is listening; database pool not yet verified.
    ForwardingUp,
    /// Session is live and the database answered a round trip.
    Connected,
    /// Session teardown in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Check if the connection is active.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is disconnected.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Check if a connect or disconnect is underway.
    pub fn is_transitioning(&self) -> bool {
        !matches!(self, Self::Connected | Self::Disconnected)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, ForwardingUp)
                | (Authenticating, Disconnected)
                | (ForwardingUp, Connected)
                | (ForwardingUp, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::ForwardingUp => "forwarding",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Result of a successful `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A session is live (newly created or already present).
    Connected,
    /// The operator dismissed the credential prompt.
    Cancelled,
}

impl ConnectOutcome {
    /// Treat a cancelled prompt as an error.
    pub fn require_connected(self) -> Result<(), crate::TubscopeError> {
        match self {
            Self::Connected => Ok(()),
            Self::Cancelled => Err(crate::TubscopeError::ConnectionCancelled),
        }
    }
}

/// Timeouts and pool tuning for a tunnelled session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// SSH TCP connect + handshake timeout in seconds
    pub ssh_connect_timeout_secs: u64,
    /// SSH keepalive interval in seconds
    pub ssh_keepalive_secs: u64,
    /// Time to wait for a database connection from the pool, in seconds
    pub db_connect_timeout_secs: u64,
    /// Server-side statement limit in milliseconds (MAX_EXECUTION_TIME)
    pub max_execution_time_ms: u64,
    /// Connections older than this are recycled, in seconds
    pub pool_recycle_secs: u64,
    /// Maximum pooled database connections
    pub pool_max_size: usize,
    /// How long `disconnect()` waits for the forwarder to exit, in milliseconds
    pub forwarder_join_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ssh_connect_timeout_secs: 15,
            ssh_keepalive_secs: 30,
            db_connect_timeout_secs: 10,
            max_execution_time_ms: 29_999,
            pool_recycle_secs: 30 * 60,
            pool_max_size: 4,
            forwarder_join_timeout_ms: 2_000,
        }
    }
}

impl ConnectionOptions {
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_keepalive(&self) -> Duration {
        Duration::from_secs(self.ssh_keepalive_secs)
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle_secs)
    }

    pub fn forwarder_join_timeout(&self) -> Duration {
        Duration::from_millis(self.forwarder_join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ConnectionState::*;
        let path = [Disconnected, Connecting, Authenticating, ForwardingUp, Connected, Disconnecting, Disconnected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_cancel_skips_connected() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(!Connecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn test_cancelled_outcome_is_error() {
        assert!(ConnectOutcome::Connected.require_connected().is_ok());
        let err = ConnectOutcome::Cancelled.require_connected().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_default_options() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.ssh_connect_timeout(), Duration::from_secs(15));
        assert_eq!(opts.pool_recycle(), Duration::from_secs(1800));
        assert_eq!(opts.forwarder_join_timeout(), Duration::from_secs(2));
    }
}
