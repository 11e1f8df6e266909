//! Application state management.
//!
//! [`AppState`] owns everything a front end needs for one operator session: the
//! loaded configuration, a worker runtime, the tunnel connector and the query
//! orchestrator reading through it. Database work runs on the worker runtime,
//! never on the caller's thread unless the caller asks for `block_on`.

use crate::config::{self, AppConfig};
use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{ConnectOutcome, ConnectionState, QueryOutcome, QueryWindow};
use crate::services::{
    select_secret_store, CredentialPrompt, CredentialService, LogSink, QueryOrchestrator,
    QuerySettings, SecretStore, TunnelConnector,
};

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Central application state.
pub struct AppState {
    config: RwLock<AppConfig>,
    data_dir: PathBuf,
    credentials: CredentialService,
    connector: Arc<TunnelConnector>,
    orchestrator: QueryOrchestrator,
    tokio_runtime: tokio::runtime::Runtime,
}

impl AppState {
    /// State in the default data directory with the build's default secret store.
    pub fn new(prompt: Arc<dyn CredentialPrompt>) -> TubscopeResult<Self> {
        Self::with_data_dir(config::default_data_dir(), select_secret_store(), prompt)
    }

    /// State with a custom data directory and secret store (for testing).
    pub fn with_data_dir(
        data_dir: PathBuf,
        store: Arc<dyn SecretStore>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> TubscopeResult<Self> {
        config::init_data_dir(&data_dir)?;
        let app_config = AppConfig::load(&AppConfig::path_in(&data_dir));
        app_config.validate()?;

        let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tubscope-worker")
            .enable_all()
            .build()
            .map_err(|e| TubscopeError::internal(format!("Failed to create tokio runtime: {e}")))?;

        let credentials = CredentialService::new(store, app_config.secret_service.clone());
        let connector = Arc::new(TunnelConnector::new(
            credentials.clone(),
            prompt,
            app_config.schema.clone(),
            app_config.connection.clone(),
        ));
        let orchestrator = QueryOrchestrator::new(
            Arc::clone(&connector),
            QuerySettings {
                reference_zone: app_config.reference_timezone,
                temperature_unit: app_config.temperature_unit,
                row_limit: app_config.row_limit,
            },
        );

        tracing::info!(
            data_dir = %data_dir.display(),
            store = credentials.store().name(),
            timezone = %app_config.reference_timezone,
            "AppState initialized"
        );

        Ok(Self {
            config: RwLock::new(app_config),
            data_dir,
            credentials,
            connector,
            orchestrator,
            tokio_runtime,
        })
    }

    /// Replace the orchestrator's operator sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.orchestrator.set_sink(sink);
        self
    }

    // ========== Configuration ==========

    /// Snapshot of the current configuration.
    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Modify and persist the configuration.
    ///
    /// Zone, unit and schema changes take effect for the next `AppState`.
    pub fn update_config(&self, update: impl FnOnce(&mut AppConfig)) -> TubscopeResult<()> {
        let mut config = self.config.write();
        let mut next = config.clone();
        update(&mut next);
        next.save(&AppConfig::path_in(&self.data_dir))?;
        *config = next;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ========== Services ==========

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub fn connector(&self) -> &Arc<TunnelConnector> {
        &self.connector
    }

    pub fn orchestrator(&self) -> &QueryOrchestrator {
        &self.orchestrator
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    // ========== Operations ==========

    /// Connect if needed, then run `window`. The window is remembered as the
    /// last query whether or not it finds anything.
    pub async fn query(&self, window: &QueryWindow, columns: Option<Vec<String>>) -> QueryOutcome {
        if let Err(e) = self.update_config(|c| c.last_query = Some(window.clone())) {
            tracing::warn!(error = %e, "Failed to remember last query");
        }

        match self.connector.connect().await {
            Ok(ConnectOutcome::Connected) => {}
            Ok(ConnectOutcome::Cancelled) => {
                return QueryOutcome::Failed(TubscopeError::ConnectionCancelled);
            }
            Err(e) => return QueryOutcome::Failed(e),
        }

        self.orchestrator.run_with_columns(window, columns).await
    }

    /// Connect and run the warm-up query. Failures are logged only.
    pub async fn warm_up(&self) {
        match self.connector.connect().await {
            Ok(ConnectOutcome::Connected) => self.orchestrator.warm_up().await,
            Ok(ConnectOutcome::Cancelled) => tracing::info!("Warm-up skipped: connection cancelled"),
            Err(e) => tracing::warn!(error = %e, "Warm-up skipped: connect failed"),
        }
    }

    /// Tear down the session, if any.
    pub fn shutdown(&self) {
        self.tokio_runtime.block_on(self.connector.disconnect());
    }

    // ========== Runtime ==========

    pub fn runtime(&self) -> &tokio::runtime::Runtime {
        &self.tokio_runtime
    }

    /// Spawn a future on the worker runtime.
    pub fn spawn<F, T>(&self, future: F) -> tokio::task::JoinHandle<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.tokio_runtime.spawn(future)
    }

    /// Block on a future using the worker runtime.
    ///
    /// Do not call from inside the runtime.
    pub fn block_on<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.tokio_runtime.block_on(future)
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown();
    }
}
