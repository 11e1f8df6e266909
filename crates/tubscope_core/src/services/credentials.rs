//! Secret storage and credential collection.
//!
//! Credentials live in a [`SecretStore`] keyed by `(service, key)`:
//!
//! - **Debug builds**: [`FileSecretStore`] at `~/.config/tubscope/dev_credentials.json`,
//!   unless `TUBSCOPE_USE_KEYCHAIN=1` is set
//! - **Release builds**: [`KeychainSecretStore`] (macOS Keychain, Windows Credential
//!   Manager, Linux Secret Service)
//! - **Fallback**: [`SessionSecretStore`], lost when the process exits
//!
//! When values are missing, the connector hands the store to a [`CredentialPrompt`]
//! which fills it in (or is dismissed).

use crate::error::{TubscopeError, TubscopeResult};
use crate::models::{CredentialKey, Credentials};

use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variable to force keychain usage in debug builds.
pub const FORCE_KEYCHAIN_ENV: &str = "TUBSCOPE_USE_KEYCHAIN";

// ============================================================================
// SecretStore
// ============================================================================

/// Get/set/delete of secret values by `(service, key)`.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> TubscopeResult<Option<String>>;

    fn set(&self, service: &str, key: &str, value: &str) -> TubscopeResult<()>;

    /// Deleting a missing entry is not an error.
    fn delete(&self, service: &str, key: &str) -> TubscopeResult<()>;

    /// Store name for logging.
    fn name(&self) -> &'static str;
}

// ============================================================================
// FileSecretStore
// ============================================================================

/// JSON file store for development builds.
///
/// Avoids keychain prompts for unsigned binaries. The file is created `0600` on Unix.
#[derive(Debug)]
pub struct FileSecretStore {
    file_path: PathBuf,
    cache: RwLock<HashMap<String, HashMap<String, String>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SecretsFile {
    services: HashMap<String, HashMap<String, String>>,
}

impl FileSecretStore {
    /// Open the store at `~/.config/tubscope/dev_credentials.json`.
    pub fn new() -> TubscopeResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TubscopeError::storage("Could not determine config directory", None))?
            .join("tubscope");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| {
                TubscopeError::storage(
                    format!("Failed to create config directory: {e}"),
                    Some("Check permissions for ~/.config/tubscope"),
                )
            })?;
        }

        Self::with_path(config_dir.join("dev_credentials.json"))
    }

    /// Open the store at a specific path.
    pub fn with_path(file_path: PathBuf) -> TubscopeResult<Self> {
        let store = Self { file_path, cache: RwLock::new(HashMap::new()) };
        store.load_from_file()?;
        Ok(store)
    }

    fn load_from_file(&self) -> TubscopeResult<()> {
        if !self.file_path.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.file_path).map_err(|e| {
            TubscopeError::storage(format!("Failed to read credentials file: {e}"), None)
        })?;
        if contents.trim().is_empty() {
            return Ok(());
        }

        let file: SecretsFile = serde_json::from_str(&contents).map_err(|e| {
            TubscopeError::storage(format!("Invalid credentials file format: {e}"), None)
        })?;

        *self.cache.write() = file.services;
        Ok(())
    }

    fn save_to_file(&self) -> TubscopeResult<()> {
        let file = SecretsFile { services: self.cache.read().clone() };
        let json = serde_json::to_string_pretty(&file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut out = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.file_path)
                .map_err(|e| {
                    TubscopeError::storage(format!("Failed to create credentials file: {e}"), None)
                })?;
            out.write_all(json.as_bytes()).map_err(|e| {
                TubscopeError::storage(format!("Failed to write credentials file: {e}"), None)
            })?;
        }

        #[cfg(not(unix))]
        {
            let mut out = fs::File::create(&self.file_path).map_err(|e| {
                TubscopeError::storage(format!("Failed to create credentials file: {e}"), None)
            })?;
            out.write_all(json.as_bytes()).map_err(|e| {
                TubscopeError::storage(format!("Failed to write credentials file: {e}"), None)
            })?;
        }

        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, service: &str, key: &str) -> TubscopeResult<Option<String>> {
        Ok(self.cache.read().get(service).and_then(|entries| entries.get(key)).cloned())
    }

    fn set(&self, service: &str, key: &str, value: &str) -> TubscopeResult<()> {
        self.cache
            .write()
            .entry(service.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.save_to_file()?;
        tracing::debug!(service, key, "Secret stored in file");
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> TubscopeResult<()> {
        let removed = {
            let mut cache = self.cache.write();
            let removed = cache.get_mut(service).and_then(|entries| entries.remove(key));
            if cache.get(service).is_some_and(HashMap::is_empty) {
                cache.remove(service);
            }
            removed
        };
        if removed.is_some() {
            self.save_to_file()?;
            tracing::debug!(service, key, "Secret deleted from file");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FileSecretStore"
    }
}

// ============================================================================
// KeychainSecretStore
// ============================================================================

/// OS keychain store.
#[derive(Debug, Default)]
pub struct KeychainSecretStore;

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self
    }
}

impl SecretStore for KeychainSecretStore {
    fn get(&self, service: &str, key: &str) -> TubscopeResult<Option<String>> {
        let entry =
            Entry::new(service, key).map_err(|e| TubscopeError::keyring(e.to_string(), None))?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, service: &str, key: &str, value: &str) -> TubscopeResult<()> {
        Entry::new(service, key)
            .map_err(|e| TubscopeError::keyring(e.to_string(), None))?
            .set_password(value)?;
        tracing::debug!(service, key, "Secret stored in keychain");
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> TubscopeResult<()> {
        let entry =
            Entry::new(service, key).map_err(|e| TubscopeError::keyring(e.to_string(), None))?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!(service, key, "Secret deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "KeychainSecretStore"
    }
}

// ============================================================================
// SessionSecretStore
// ============================================================================

/// In-memory store for when neither file nor keychain is usable.
#[derive(Debug, Default)]
pub struct SessionSecretStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl SessionSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for SessionSecretStore {
    fn get(&self, service: &str, key: &str) -> TubscopeResult<Option<String>> {
        Ok(self.entries.read().get(&(service.to_string(), key.to_string())).cloned())
    }

    fn set(&self, service: &str, key: &str, value: &str) -> TubscopeResult<()> {
        self.entries.write().insert((service.to_string(), key.to_string()), value.to_string());
        tracing::debug!(service, key, "Secret stored in session");
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> TubscopeResult<()> {
        self.entries.write().remove(&(service.to_string(), key.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionSecretStore"
    }
}

/// Pick a store for the build type.
pub fn select_secret_store() -> Arc<dyn SecretStore> {
    let force_keychain = std::env::var(FORCE_KEYCHAIN_ENV).map(|v| v == "1").unwrap_or(false);

    #[cfg(debug_assertions)]
    {
        if force_keychain {
            tracing::debug!(store = "KeychainSecretStore", reason = "TUBSCOPE_USE_KEYCHAIN=1", "Using keychain (override)");
            return Arc::new(KeychainSecretStore::new());
        }

        match FileSecretStore::new() {
            Ok(store) => {
                tracing::debug!(store = "FileSecretStore", reason = "debug build", "Using file-based secret storage");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open file secret store, falling back to session");
                Arc::new(SessionSecretStore::new())
            }
        }
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = force_keychain;
        tracing::debug!(store = "KeychainSecretStore", reason = "release build", "Using keychain secret storage");
        Arc::new(KeychainSecretStore::new())
    }
}

// ============================================================================
// CredentialPrompt
// ============================================================================

/// What the operator did with the credential prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Values were written to the store.
    Saved,
    /// The prompt was dismissed.
    Cancelled,
}

/// Blocking "collect missing credentials" capability.
///
/// Implementations write whatever they gather straight into `store` under
/// `service`. The connector reloads from the store afterwards, so a prompt that
/// reports `Saved` without filling everything in still fails the connect.
pub trait CredentialPrompt: Send + Sync {
    fn collect(
        &self,
        store: &dyn SecretStore,
        service: &str,
        missing: &[CredentialKey],
    ) -> TubscopeResult<PromptOutcome>;
}

/// Prompt that never collects anything. For headless use.
#[derive(Debug, Default)]
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn collect(
        &self,
        _store: &dyn SecretStore,
        _service: &str,
        _missing: &[CredentialKey],
    ) -> TubscopeResult<PromptOutcome> {
        Ok(PromptOutcome::Cancelled)
    }
}

// ============================================================================
// CredentialService
// ============================================================================

/// Reads and writes the connector's credential set in one service namespace.
#[derive(Clone)]
pub struct CredentialService {
    store: Arc<dyn SecretStore>,
    service: String,
}

impl CredentialService {
    pub fn new(store: Arc<dyn SecretStore>, service: impl Into<String>) -> Self {
        let service = service.into();
        tracing::info!(store = store.name(), service = %service, "Credential service initialized");
        Self { store, service }
    }

    pub fn store(&self) -> Arc<dyn SecretStore> {
        Arc::clone(&self.store)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Read every key. Absent keys come back empty.
    pub fn load(&self) -> TubscopeResult<Credentials> {
        let mut creds = Credentials::default();
        for key in CredentialKey::ALL {
            if let Some(value) = self.store.get(&self.service, key.as_str())? {
                creds.set(key, value);
            }
        }
        Ok(creds)
    }

    /// Write every non-empty field.
    pub fn save(&self, creds: &Credentials) -> TubscopeResult<()> {
        for key in CredentialKey::ALL {
            let value = creds.get(key);
            if !value.is_empty() {
                self.store.set(&self.service, key.as_str(), value)?;
            }
        }
        Ok(())
    }

    pub fn set(&self, key: CredentialKey, value: &str) -> TubscopeResult<()> {
        self.store.set(&self.service, key.as_str(), value.trim())
    }

    pub fn delete(&self, key: CredentialKey) -> TubscopeResult<()> {
        self.store.delete(&self.service, key.as_str())
    }

    /// Remove every key in the namespace.
    pub fn clear(&self) -> TubscopeResult<()> {
        for key in CredentialKey::ALL {
            self.store.delete(&self.service, key.as_str())?;
        }
        tracing::info!(service = %self.service, "Credentials cleared");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService")
            .field("store", &self.store.name())
            .field("service", &self.service)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::with_path(dir.path().join("secrets.json")).unwrap();

        store.set("svc", "SSH_HOST", "bastion").unwrap();
        assert_eq!(store.get("svc", "SSH_HOST").unwrap(), Some("bastion".to_string()));
        assert_eq!(store.get("other", "SSH_HOST").unwrap(), None);

        store.delete("svc", "SSH_HOST").unwrap();
        assert_eq!(store.get("svc", "SSH_HOST").unwrap(), None);
        store.delete("svc", "SSH_HOST").unwrap();
    }

    #[test]
    fn test_file_store_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        {
            let store = FileSecretStore::with_path(path.clone()).unwrap();
            store.set("svc", "MYSQL_DB", "telemetry").unwrap();
        }
        let store = FileSecretStore::with_path(path).unwrap();
        assert_eq!(store.get("svc", "MYSQL_DB").unwrap(), Some("telemetry".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let store = FileSecretStore::with_path(path.clone()).unwrap();
        store.set("svc", "SSH_PASSWORD", "hunter2").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_session_store() {
        let store = SessionSecretStore::new();
        store.set("svc", "k", "v").unwrap();
        assert_eq!(store.get("svc", "k").unwrap(), Some("v".to_string()));
        store.delete("svc", "k").unwrap();
        assert_eq!(store.get("svc", "k").unwrap(), None);
    }

    #[test]
    fn test_service_load_and_clear() {
        let service = CredentialService::new(Arc::new(SessionSecretStore::new()), "PlungeTubApp");
        service.set(CredentialKey::SshHost, " bastion.example ").unwrap();
        service.set(CredentialKey::SshPort, "2222").unwrap();

        let creds = service.load().unwrap();
        assert_eq!(creds.ssh_host, "bastion.example");
        assert_eq!(creds.ssh_port().unwrap(), 2222);
        assert!(creds.missing().contains(&CredentialKey::MysqlDb));

        service.clear().unwrap();
        assert_eq!(service.load().unwrap(), Credentials::default());
    }

    #[test]
    fn test_no_prompt_cancels() {
        let store = SessionSecretStore::new();
        let outcome = NoPrompt.collect(&store, "svc", &CredentialKey::ALL).unwrap();
        assert_eq!(outcome, PromptOutcome::Cancelled);
    }
}
