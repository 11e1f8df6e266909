//! Local TCP forwarder over a multiplexed transport.
//!
//! [`TunnelForwarder`] listens on `127.0.0.1:<port>`. Every accepted socket gets its
//! own channel from a [`ChannelOpener`] and its own relay task. Both directions of a
//! relay are pumped independently; the relay ends, closing both sides, as soon as
//! either direction reaches EOF or fails. A failed relay never affects the others.
//!
//! Stopping the forwarder only closes the listener. Relays already running keep
//! pumping until their own client or channel closes.

use crate::error::{TubscopeError, TubscopeResult};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bidirectional byte stream to the far side of the tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

pub type BoxedTunnelStream = Box<dyn TunnelStream>;

/// Opens one forwarding channel per local connection.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a channel to `remote_host:remote_port` on behalf of `originator`.
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> TubscopeResult<BoxedTunnelStream>;
}

/// Reserve a free loopback port by binding and immediately releasing it.
pub fn find_available_port() -> TubscopeResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        TubscopeError::connection_with_source("Failed to reserve a local port", e)
    })?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Running local forwarder.
pub struct TunnelForwarder {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    active_relays: Arc<AtomicUsize>,
    cancel_token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelForwarder {
    /// Bind `127.0.0.1:local_port` and start accepting.
    ///
    /// Port 0 picks an ephemeral port; [`TunnelForwarder::local_port`] reports it.
    pub async fn start(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        opener: Arc<dyn ChannelOpener>,
    ) -> TubscopeResult<Self> {
        let remote_host = remote_host.into();
        let listener = TcpListener::bind(("127.0.0.1", local_port)).await.map_err(|e| {
            TubscopeError::connection_with_source(
                format!("Failed to bind local port {local_port} for forwarding"),
                e,
            )
        })?;
        let local_port = listener.local_addr()?.port();

        let running = Arc::new(AtomicBool::new(true));
        let active_relays = Arc::new(AtomicUsize::new(0));
        let cancel_token = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            opener,
            remote_host.clone(),
            remote_port,
            Arc::clone(&running),
            Arc::clone(&active_relays),
            cancel_token.clone(),
        ));

        tracing::info!(local_port, remote_host = %remote_host, remote_port, "Forwarder listening");

        Ok(Self {
            local_port,
            remote_host,
            remote_port,
            running,
            active_relays,
            cancel_token,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Relays currently pumping bytes.
    pub fn active_relays(&self) -> usize {
        self.active_relays.load(Ordering::SeqCst)
    }

    /// Stop accepting. Never blocks; live relays are neither waited for nor cut.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // The accept loop selects on the token, so this wakes a parked accept.
        self.cancel_token.cancel();

        tracing::info!(local_port = self.local_port, "Forwarder stopped");
    }

    /// Wait up to `timeout` for the accept loop to exit. Returns whether it did.
    pub async fn join(&self, timeout: Duration) -> bool {
        let Some(task) = self.accept_task.lock().take() else {
            return true;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(timeout, task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(local_port = self.local_port, "Forwarder did not exit in time");
                abort.abort();
                false
            }
        }
    }
}

impl Drop for TunnelForwarder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    active_relays: Arc<AtomicUsize>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept forwarded connection");
                        continue;
                    }
                };
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::debug!(%peer, "Forwarded connection accepted");

                let opener = Arc::clone(&opener);
                let remote_host = remote_host.clone();
                let relay_count = RelayCount::enter(&active_relays);

                tokio::spawn(async move {
                    let _relay_count = relay_count;
                    let channel = match opener.open_channel(&remote_host, remote_port, peer).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "Failed to open channel, dropping connection");
                            return;
                        }
                    };
                    relay(socket, channel, peer).await;
                });
            }
        }
    }
    tracing::debug!("Forwarder accept loop exited");
}

/// Pump bytes both ways until one side finishes, then close both.
async fn relay(socket: TcpStream, channel: BoxedTunnelStream, peer: SocketAddr) {
    let (mut local_rd, mut local_wr) = socket.into_split();
    let (mut chan_rd, mut chan_wr) = tokio::io::split(channel);

    let upstream = tokio::io::copy(&mut local_rd, &mut chan_wr);
    let downstream = tokio::io::copy(&mut chan_rd, &mut local_wr);

    tokio::select! {
        result = upstream => match result {
            Ok(bytes) => tracing::debug!(%peer, bytes, "Client closed connection"),
            Err(e) => tracing::debug!(%peer, error = %e, "Client side failed"),
        },
        result = downstream => match result {
            Ok(bytes) => tracing::debug!(%peer, bytes, "Remote closed channel"),
            Err(e) => tracing::debug!(%peer, error = %e, "Remote side failed"),
        },
    }

    let _ = chan_wr.shutdown().await;
    let _ = local_wr.shutdown().await;
}

/// Keeps `active_relays` accurate however a relay task ends.
struct RelayCount(Arc<AtomicUsize>);

impl RelayCount {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for RelayCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
