//! Backend services for Tubscope.
//!
//! - `credentials` - Secret stores and the credential prompt seam
//! - `tunnel` - Local TCP forwarder over SSH channels
//! - `ssh` - Password-authenticated SSH transport (russh)
//! - `engine` - Pooled MySQL access through the tunnel (mysql_async)
//! - `source` - The read-only metrics source trait and its SQL
//! - `normalize` - Result normalization
//! - `connector` - Session lifecycle: credentials, transport, forwarder, engine
//! - `query` - Window resolution, existence probe, fetch and fallback

pub mod connector;
pub mod credentials;
pub mod engine;
pub mod normalize;
pub mod query;
pub mod source;
pub mod ssh;
pub mod tunnel;

pub use connector::{
    Session, SessionBackend, SessionEngine, SessionTransport, TunnelBackend, TunnelConnector,
};
pub use credentials::{
    select_secret_store, CredentialPrompt, CredentialService, FileSecretStore,
    KeychainSecretStore, NoPrompt, PromptOutcome, SecretStore, SessionSecretStore,
};
pub use engine::{DbLogin, MetricsEngine};
pub use normalize::Normalizer;
pub use query::{LastAvailability, LogSink, QueryOrchestrator, QuerySettings, TracingSink};
pub use source::{FetchRequest, MetricsSource, RowFilter};
pub use ssh::SshTransport;
pub use tunnel::{find_available_port, ChannelOpener, TunnelForwarder};
