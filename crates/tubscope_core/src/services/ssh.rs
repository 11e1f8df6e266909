//! SSH transport with password authentication.

use crate::error::{TubscopeError, TubscopeResult};
use crate::models::ConnectionOptions;
use crate::services::tunnel::{BoxedTunnelStream, ChannelOpener};

use async_trait::async_trait;
use russh::client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// russh client handler.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; the bastion is reached by password only.
        Ok(true)
    }
}

/// Authenticated SSH connection that can open `direct-tcpip` channels.
pub struct SshTransport {
    handle: Arc<Mutex<client::Handle<SshClientHandler>>>,
    host: String,
    port: u16,
    user: String,
}

impl SshTransport {
    /// Connect and authenticate with a password.
    ///
    /// TCP connect, key exchange and authentication together get
    /// `options.ssh_connect_timeout()`. A rejected password is
    /// [`TubscopeError::Authentication`]; anything else that goes wrong is a
    /// connection or SSH error.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        options: &ConnectionOptions,
    ) -> TubscopeResult<Self> {
        let config = client::Config {
            keepalive_interval: Some(options.ssh_keepalive()),
            ..Default::default()
        };

        tracing::info!(host, port, user, "Connecting to SSH server");

        let limit = options.ssh_connect_timeout();
        let login = handshake(Arc::new(config), host, port, user, password);
        let handle = match tokio::time::timeout(limit, login).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TubscopeError::connection(format!(
                    "Timed out connecting to SSH server {host}:{port} after {}s",
                    limit.as_secs()
                )));
            }
        };

        tracing::info!(host, port, user, "SSH authentication successful");

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            host: host.to_string(),
            port,
            user: user.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether the underlying session has ended.
    pub async fn is_closed(&self) -> bool {
        self.handle.lock().await.is_closed()
    }

    /// Close the SSH session. Errors are logged and dropped.
    pub async fn disconnect(&self) {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle.disconnect(russh::Disconnect::ByApplication, "", "English").await {
            tracing::warn!(host = %self.host, error = %e, "SSH disconnect failed");
        } else {
            tracing::info!(host = %self.host, "SSH session closed");
        }
    }
}

#[async_trait]
impl ChannelOpener for SshTransport {
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> TubscopeResult<BoxedTunnelStream> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(
                    remote_host,
                    u32::from(remote_port),
                    originator.ip().to_string(),
                    u32::from(originator.port()),
                )
                .await
                .map_err(|e| {
                    TubscopeError::ssh_with_source(
                        format!("Failed to open channel to {remote_host}:{remote_port}: {e}"),
                        e,
                    )
                })?
        };

        Ok(Box::new(channel.into_stream()))
    }
}

/// Connect, exchange keys and log in.
async fn handshake(
    config: Arc<client::Config>,
    host: &str,
    port: u16,
    user: &str,
    password: &str,
) -> TubscopeResult<client::Handle<SshClientHandler>> {
    let connected = client::connect(config, (host, port), SshClientHandler).await;
    let mut handle = connected.map_err(|e| match e {
        russh::Error::IO(e) => TubscopeError::connection_with_source(
            format!("Failed to connect to SSH server {host}:{port}: {e}"),
            e,
        ),
        e => TubscopeError::ssh_with_source(
            format!("SSH handshake with {host}:{port} failed: {e}"),
            e,
        ),
    })?;

    let authenticated = handle.authenticate_password(user, password).await.map_err(|e| {
        TubscopeError::ssh_with_source(format!("SSH password authentication failed: {e}"), e)
    })?;

    if !authenticated {
        let _ = handle.disconnect(russh::Disconnect::ByApplication, "", "English").await;
        return Err(TubscopeError::authentication(format!(
            "SSH server {host} rejected the password for {user}"
        )));
    }
    Ok(handle)
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::server::{self, Auth};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    /// Accepts one password; stalls forever when `stall` is set.
    #[derive(Clone)]
    struct PasswordServer {
        password: &'static str,
        stall: bool,
    }

    #[async_trait]
    impl server::Handler for PasswordServer {
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if password == self.password {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject { proceed_with_methods: None })
            }
        }
    }

    async fn spawn_ssh_server(handler: PasswordServer) -> u16 {
        let config = Arc::new(server::Config {
            keys: vec![russh_keys::key::KeyPair::generate_ed25519()],
            auth_rejection_time: Duration::from_millis(10),
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });
        port
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions { ssh_connect_timeout_secs: 1, ..Default::default() }
    }

    #[tokio::test]
    async fn test_password_login_then_disconnect() {
        let port = spawn_ssh_server(PasswordServer { password: "hunter2", stall: false }).await;

        let transport =
            SshTransport::connect("127.0.0.1", port, "ops", "hunter2", &options()).await.unwrap();
        assert!(!transport.is_closed().await);

        transport.disconnect().await;
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_wrong_password_is_authentication_error() {
        let port = spawn_ssh_server(PasswordServer { password: "hunter2", stall: false }).await;

        let err = SshTransport::connect("127.0.0.1", port, "ops", "nope", &options())
            .await
            .unwrap_err();
        assert!(matches!(err, TubscopeError::Authentication { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_stalled_authentication_hits_connect_timeout() {
        let port = spawn_ssh_server(PasswordServer { password: "hunter2", stall: true }).await;

        let started = Instant::now();
        let err = SshTransport::connect("127.0.0.1", port, "ops", "hunter2", &options())
            .await
            .unwrap_err();
        assert!(matches!(err, TubscopeError::Connection { .. }), "{err}");
        assert!(err.to_string().contains("Timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
