//! Client tunnel lifecycle: dial, watch, re-dial.
//!
//! A tunnel is a quinn endpoint riding on a [`DnsPacketConn`]. When the
//! connection dies, the whole stack is rebuilt under a *fresh* session id;
//! reusing the old id would collide with recursor caches and the server's
//! session state, so a reconnect is always a brand-new rendezvous.

use crate::client_conn::{dummy_peer_addr, DnsPacketConn};
use crate::config::TunnelOptions;
use crate::session::generate_session_id;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, Endpoint, EndpointConfig, TokioRuntime, TransportConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("transport setup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration rejected: {0}")]
    Crypto(String),

    #[error("QUIC dial failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC handshake failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("QUIC dial timed out")]
    Timeout,
}

/// quinn client configuration matching what the DNS substrate can carry:
/// frequent keepalives so recursors keep state warm, a generous idle
/// timeout, and no PMTU probing (probe packets would just be fragmented
/// and prove nothing about the path).
pub fn client_quic_config(crypto: rustls::ClientConfig) -> Result<ClientConfig, TunnelError> {
    let crypto = QuicClientConfig::try_from(crypto)
        .map_err(|err| TunnelError::Crypto(err.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    transport.max_idle_timeout(Some(
        Duration::from_secs(60)
            .try_into()
            .expect("idle timeout in VarInt range"),
    ));
    transport.stream_receive_window((6u32 * 1024 * 1024).into());
    transport.receive_window((15u32 * 1024 * 1024).into());
    transport.mtu_discovery_config(None);
    config.transport_config(Arc::new(transport));

    Ok(config)
}

struct ActiveTunnel {
    endpoint: Endpoint,
    connection: Connection,
    adapter: Arc<DnsPacketConn>,
    session_id: String,
}

pub struct TunnelManager {
    resolver: SocketAddr,
    domain: String,
    opts: TunnelOptions,
    quic_config: ClientConfig,
    state: Mutex<Option<ActiveTunnel>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

impl TunnelManager {
    pub fn new(
        resolver: SocketAddr,
        domain: &str,
        opts: TunnelOptions,
        quic_config: ClientConfig,
    ) -> Self {
        Self {
            resolver,
            domain: domain.trim_end_matches('.').to_string(),
            opts,
            quic_config,
            state: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        }
    }

    /// Tear down whatever exists and dial a fresh tunnel.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let mut state = self.state.lock().await;

        if let Some(old) = state.take() {
            old.adapter.close();
            old.endpoint.close(0u32.into(), b"reconnecting");
        }

        let session_id = generate_session_id();
        log::info!("generated session id {session_id}");

        let adapter = Arc::new(
            DnsPacketConn::new(self.resolver, &self.domain, &session_id, self.opts.clone())
                .await?,
        );

        let mut endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            None,
            Arc::clone(&adapter) as Arc<dyn quinn::AsyncUdpSocket>,
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(self.quic_config.clone());

        log::info!(
            "establishing QUIC tunnel via {} for domain {}",
            self.resolver,
            self.domain
        );
        let connecting = match endpoint.connect(dummy_peer_addr(), &self.domain) {
            Ok(c) => c,
            Err(err) => {
                adapter.close();
                return Err(err.into());
            }
        };
        let connection = match tokio::time::timeout(CONNECT_TIMEOUT, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                adapter.close();
                return Err(err.into());
            }
            Err(_) => {
                adapter.close();
                return Err(TunnelError::Timeout);
            }
        };

        log::info!("QUIC tunnel established (session {session_id})");
        *state = Some(ActiveTunnel {
            endpoint,
            connection,
            adapter,
            session_id,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The live QUIC connection, if any.
    pub async fn connection(&self) -> Option<Connection> {
        self.state.lock().await.as_ref().map(|t| t.connection.clone())
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|t| t.session_id.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Redial with exponential backoff. Single-flight: concurrent callers
    /// beyond the first return immediately.
    pub async fn reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);

        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.connect().await {
                Ok(()) => {
                    log::info!("reconnected successfully");
                    break;
                }
                Err(err) => log::error!("reconnection failed: {err}"),
            }
            log::warn!("retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    pub fn spawn_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconnect().await });
    }

    /// Watch the connection; trigger a reconnect once it reports closed.
    pub fn spawn_liveness_watcher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LIVENESS_INTERVAL).await;
                let Some(conn) = manager.connection().await else {
                    continue;
                };
                if let Some(reason) = conn.close_reason() {
                    log::warn!("tunnel connection lost ({reason}), initiating reconnection");
                    manager.spawn_reconnect();
                }
            }
        });
    }

    /// Cascade close: QUIC connection, endpoint, adapter.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(active) = self.state.lock().await.take() {
            active.connection.close(0u32.into(), b"shutdown");
            active.endpoint.close(0u32.into(), b"shutdown");
            active.adapter.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff);
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[4], Duration::from_secs(16));
        assert_eq!(seen[5], Duration::from_secs(30));
        assert_eq!(seen[6], Duration::from_secs(30));
    }

    #[test]
    fn fresh_session_ids_per_connection() {
        // Each (re)connect draws a new id; collisions would fold two
        // tunnels into one server session.
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
