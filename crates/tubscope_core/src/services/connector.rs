//! Tunnel connector: credentials in, live pooled database out.
//!
//! A [`TunnelConnector`] owns at most one [`Session`]: the SSH transport, the
//! local forwarder riding on it and the database pool pointed at the forwarder.
//! The three are created together by [`TunnelConnector::connect`] and torn down
//! together by [`TunnelConnector::disconnect`]; nothing else closes them.
//!
//! The SSH and database ends are built by a [`SessionBackend`]. The default
//! [`TunnelBackend`] uses [`SshTransport`] and [`MetricsEngine`].

use crate::config::SchemaConfig;
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{ConnectOutcome, ConnectionOptions, ConnectionState, CredentialKey, Credentials};
use crate::services::credentials::{CredentialPrompt, CredentialService, PromptOutcome};
use crate::services::engine::{DbLogin, MetricsEngine};
use crate::services::source::MetricsSource;
use crate::services::ssh::SshTransport;
use crate::services::tunnel::{find_available_port, ChannelOpener, TunnelForwarder};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// SSH end of a session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Channel opener the forwarder rides on.
    fn opener(self: Arc<Self>) -> Arc<dyn ChannelOpener>;

    /// Close the transport. Errors are logged, never returned.
    async fn disconnect(&self);
}

/// Database end of a session.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    fn source(self: Arc<Self>) -> Arc<dyn MetricsSource>;

    /// Liveness round trip run once after connecting.
    async fn verify(&self) -> TubscopeResult<()>;

    /// Close every pooled connection. Errors are logged, never returned.
    async fn dispose(&self);
}

/// Builds the two ends of a session.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn open_transport(
        &self,
        creds: &Credentials,
        ssh_port: u16,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Arc<dyn SessionTransport>>;

    /// Engine aimed at the forwarder on `local_port`. Must not connect yet.
    fn open_engine(
        &self,
        local_port: u16,
        login: &DbLogin,
        schema: SchemaConfig,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Arc<dyn SessionEngine>>;
}

/// Password SSH plus a pooled MySQL engine.
pub struct TunnelBackend;

#[async_trait]
impl SessionBackend for TunnelBackend {
    async fn open_transport(
        &self,
        creds: &Credentials,
        ssh_port: u16,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Arc<dyn SessionTransport>> {
        let transport = SshTransport::connect(
            &creds.ssh_host,
            ssh_port,
            &creds.ssh_user,
            &creds.ssh_secret,
            options,
        )
        .await?;
        Ok(Arc::new(transport))
    }

    fn open_engine(
        &self,
        local_port: u16,
        login: &DbLogin,
        schema: SchemaConfig,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Arc<dyn SessionEngine>> {
        Ok(Arc::new(MetricsEngine::new(local_port, login, schema, options)?))
    }
}

#[async_trait]
impl SessionTransport for SshTransport {
    fn opener(self: Arc<Self>) -> Arc<dyn ChannelOpener> {
        self
    }

    async fn disconnect(&self) {
        SshTransport::disconnect(self).await;
    }
}

#[async_trait]
impl SessionEngine for MetricsEngine {
    fn source(self: Arc<Self>) -> Arc<dyn MetricsSource> {
        self
    }

    async fn verify(&self) -> TubscopeResult<()> {
        MetricsEngine::verify(self).await
    }

    async fn dispose(&self) {
        MetricsEngine::dispose(self).await;
    }
}

/// Everything that exists while connected.
pub struct Session {
    id: Uuid,
    transport: Arc<dyn SessionTransport>,
    forwarder: TunnelForwarder,
    engine: Arc<dyn SessionEngine>,
    connected_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_port(&self) -> u16 {
        self.forwarder.local_port()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Engine, forwarder, transport. Each step runs whatever the previous did.
    async fn teardown(self, options: &ConnectionOptions) {
        let Session { id, transport, forwarder, engine, .. } = self;
        tracing::info!(session_id = %id, "Tearing down session");

        engine.dispose().await;

        forwarder.stop();
        if !forwarder.join(options.forwarder_join_timeout()).await {
            tracing::warn!(session_id = %id, "Forwarder join timed out");
        }
        drop(forwarder);

        transport.disconnect().await;
        drop(transport);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local_port", &self.local_port())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Builds and owns the tunnelled session.
pub struct TunnelConnector {
    backend: Arc<dyn SessionBackend>,
    credentials: CredentialService,
    prompt: Arc<dyn CredentialPrompt>,
    schema: SchemaConfig,
    options: ConnectionOptions,
    session: tokio::sync::Mutex<Option<Session>>,
    state: RwLock<ConnectionState>,
}

impl TunnelConnector {
    pub fn new(
        credentials: CredentialService,
        prompt: Arc<dyn CredentialPrompt>,
        schema: SchemaConfig,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            backend: Arc::new(TunnelBackend),
            credentials,
            prompt,
            schema,
            options,
            session: tokio::sync::Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Build sessions with `backend` instead of SSH and MySQL.
    pub fn with_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    /// Forwarder port of the live session.
    pub async fn local_port(&self) -> Option<u16> {
        self.session.lock().await.as_ref().map(Session::local_port)
    }

    /// Engine of the live session.
    pub async fn source(&self) -> TubscopeResult<Arc<dyn MetricsSource>> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or(TubscopeError::NotConnected)?;
        Ok(Arc::clone(&session.engine).source())
    }

    /// Connect unless already connected.
    ///
    /// Missing credentials trigger the prompt once. A dismissed prompt returns
    /// [`ConnectOutcome::Cancelled`]; anything else that stops the connect is an
    /// error, and the connector is back in `Disconnected` either way.
    pub async fn connect(&self) -> TubscopeResult<ConnectOutcome> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Ok(ConnectOutcome::Connected);
        }

        self.set_state(ConnectionState::Connecting);

        let creds = match self.resolve_credentials().await {
            Ok(Some(creds)) => creds,
            Ok(None) => {
                tracing::info!("Connection cancelled at credential prompt");
                self.set_state(ConnectionState::Disconnected);
                return Ok(ConnectOutcome::Cancelled);
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        match self.open_session(&creds).await {
            Ok(session) => {
                tracing::info!(
                    session_id = %session.id,
                    local_port = session.local_port(),
                    "Connected"
                );
                *slot = Some(session);
                self.set_state(ConnectionState::Connected);
                Ok(ConnectOutcome::Connected)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connect failed");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear the session down. A no-op when there is none.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            return;
        };

        self.set_state(ConnectionState::Disconnecting);
        session.teardown(&self.options).await;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Disconnected");
    }

    /// Load credentials, prompting once if any are missing. `None` means cancelled.
    async fn resolve_credentials(&self) -> TubscopeResult<Option<Credentials>> {
        let creds = self.load_credentials().await?;
        let missing = creds.missing();
        if missing.is_empty() {
            return Ok(Some(creds));
        }

        tracing::info!(
            missing = ?missing.iter().map(CredentialKey::as_str).collect::<Vec<_>>(),
            "Credentials incomplete, prompting"
        );

        let prompt = Arc::clone(&self.prompt);
        let store = self.credentials.store();
        let service = self.credentials.service().to_string();
        let outcome = tokio::task::spawn_blocking(move || prompt.collect(&*store, &service, &missing))
            .await
            .map_err(|e| TubscopeError::internal(format!("Credential prompt panicked: {e}")))??;

        if outcome == PromptOutcome::Cancelled {
            return Ok(None);
        }

        let creds = self.load_credentials().await?;
        let missing = creds.missing();
        if !missing.is_empty() {
            return Err(TubscopeError::missing_credentials(missing));
        }
        Ok(Some(creds))
    }

    async fn load_credentials(&self) -> TubscopeResult<Credentials> {
        let service = self.credentials.clone();
        tokio::task::spawn_blocking(move || service.load())
            .await
            .map_err(|e| TubscopeError::internal(format!("Credential load panicked: {e}")))?
    }

    /// Transport, forwarder, engine, liveness check. Unwinds whatever was built on failure.
    async fn open_session(&self, creds: &Credentials) -> TubscopeResult<Session> {
        let ssh_port = creds
            .ssh_port()
            .map_err(|e| TubscopeError::invalid_credential(CredentialKey::SshPort, e))?;
        let remote_port = creds
            .remote_bind_port()
            .map_err(|e| TubscopeError::invalid_credential(CredentialKey::RemoteBindPort, e))?;

        self.set_state(ConnectionState::Authenticating);
        let transport = self.backend.open_transport(creds, ssh_port, &self.options).await?;

        let forwarder = match self.start_forwarder(&transport, creds, remote_port).await {
            Ok(forwarder) => forwarder,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };
        self.set_state(ConnectionState::ForwardingUp);

        let login = DbLogin {
            user: creds.db_user.clone(),
            password: creds.db_secret.clone(),
            database: creds.db_name.clone(),
        };
        let engine = match self.backend.open_engine(
            forwarder.local_port(),
            &login,
            self.schema.clone(),
            &self.options,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                forwarder.stop();
                forwarder.join(self.options.forwarder_join_timeout()).await;
                transport.disconnect().await;
                return Err(e);
            }
        };

        let session = Session {
            id: Uuid::new_v4(),
            transport,
            forwarder,
            engine,
            connected_at: Utc::now(),
        };

        if let Err(e) = session.engine.verify().await {
            session.teardown(&self.options).await;
            return Err(e);
        }

        Ok(session)
    }

    async fn start_forwarder(
        &self,
        transport: &Arc<dyn SessionTransport>,
        creds: &Credentials,
        remote_port: u16,
    ) -> TubscopeResult<TunnelForwarder> {
        let local_port = find_available_port()?;
        TunnelForwarder::start(
            local_port,
            creds.remote_bind_host.clone(),
            remote_port,
            Arc::clone(transport).opener(),
        )
        .await
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(from = %*state, to = %next, "Unexpected connector state change");
        }
        tracing::debug!(from = %*state, to = %next, "Connector state");
        *state = next;
    }
}

impl Drop for TunnelConnector {
    fn drop(&mut self) {
        if self.session.get_mut().is_some() {
            tracing::warn!("Connector dropped while connected; session closed without teardown");
        }
    }
}
