//! Connection credentials for the SSH host and the tunnelled database.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of every value the connector reads from the secret store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKey {
    SshHost,
    SshPort,
    SshUser,
    SshPassword,
    RemoteBindHost,
    RemoteBindPort,
    MysqlUser,
    MysqlPassword,
    MysqlDb,
}

impl CredentialKey {
    /// All keys, in the order a prompt should ask for them.
    pub const ALL: [CredentialKey; 9] = [
        Self::SshHost,
        Self::SshPort,
        Self::SshUser,
        Self::SshPassword,
        Self::RemoteBindHost,
        Self::RemoteBindPort,
        Self::MysqlUser,
        Self::MysqlPassword,
        Self::MysqlDb,
    ];

    /// Key name as stored in the secret store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SshHost => "SSH_HOST",
            Self::SshPort => "SSH_PORT",
            Self::SshUser => "SSH_USER",
            Self::SshPassword => "SSH_PASSWORD",
            Self::RemoteBindHost => "REMOTE_BIND_HOST",
            Self::RemoteBindPort => "REMOTE_BIND_PORT",
            Self::MysqlUser => "MYSQL_USER",
            Self::MysqlPassword => "MYSQL_PASSWORD",
            Self::MysqlDb => "MYSQL_DB",
        }
    }

    /// Parse a stored key name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Whether the value must be masked on entry and never logged.
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::SshPassword | Self::MysqlPassword)
    }

    /// Value a prompt should prefill when the store has nothing.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Self::SshPort => Some("22"),
            Self::RemoteBindPort => Some("3306"),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full credential set for one connection attempt.
///
/// Read fresh at the start of every `connect()`; never cached past the call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ssh_host: String,
    pub ssh_port: String,
    pub ssh_user: String,
    pub ssh_secret: String,
    pub remote_bind_host: String,
    pub remote_bind_port: String,
    pub db_user: String,
    pub db_secret: String,
    pub db_name: String,
}

impl Credentials {
    /// Value of a single field.
    pub fn get(&self, key: CredentialKey) -> &str {
        match key {
            CredentialKey::SshHost => &self.ssh_host,
            CredentialKey::SshPort => &self.ssh_port,
            CredentialKey::SshUser => &self.ssh_user,
            CredentialKey::SshPassword => &self.ssh_secret,
            CredentialKey::RemoteBindHost => &self.remote_bind_host,
            CredentialKey::RemoteBindPort => &self.remote_bind_port,
            CredentialKey::MysqlUser => &self.db_user,
            CredentialKey::MysqlPassword => &self.db_secret,
            CredentialKey::MysqlDb => &self.db_name,
        }
    }

    /// Set a single field. Surrounding whitespace is dropped.
    pub fn set(&mut self, key: CredentialKey, value: impl Into<String>) {
        let value = value.into().trim().to_string();
        let slot = match key {
            CredentialKey::SshHost => &mut self.ssh_host,
            CredentialKey::SshPort => &mut self.ssh_port,
            CredentialKey::SshUser => &mut self.ssh_user,
            CredentialKey::SshPassword => &mut self.ssh_secret,
            CredentialKey::RemoteBindHost => &mut self.remote_bind_host,
            CredentialKey::RemoteBindPort => &mut self.remote_bind_port,
            CredentialKey::MysqlUser => &mut self.db_user,
            CredentialKey::MysqlPassword => &mut self.db_secret,
            CredentialKey::MysqlDb => &mut self.db_name,
        };
        *slot = value;
    }

    /// Keys whose value is empty, in prompt order.
    pub fn missing(&self) -> Vec<CredentialKey> {
        CredentialKey::ALL.into_iter().filter(|k| self.get(*k).trim().is_empty()).collect()
    }

    /// Whether every field is filled in.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// SSH port as a number.
    pub fn ssh_port(&self) -> Result<u16, String> {
        parse_port(&self.ssh_port)
    }

    /// Remote database port as a number.
    pub fn remote_bind_port(&self) -> Result<u16, String> {
        parse_port(&self.remote_bind_port)
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.trim().parse::<u16>() {
        Ok(0) => Err("port 0 is not allowed".to_string()),
        Ok(port) => Ok(port),
        Err(e) => Err(format!("'{}' is not a port: {e}", raw.trim())),
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_secret", &"<redacted>")
            .field("remote_bind_host", &self.remote_bind_host)
            .field("remote_bind_port", &self.remote_bind_port)
            .field("db_user", &self.db_user)
            .field("db_secret", &"<redacted>")
            .field("db_name", &self.db_name)
            .finish()
    }
}
