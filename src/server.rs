//! Server runtime: DNS front door, QUIC listener on the virtual conduit,
//! and per-stream target proxying.

use crate::config::ServerOptions;
use crate::handler::DnsHandler;
use crate::server_conn::VirtualConn;
use crate::session::SessionManager;
use crate::socks::{self, TargetDialer};
use anyhow::{bail, Context as _, Result};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, Endpoint, EndpointConfig, RecvStream, SendStream, TokioRuntime, TransportConfig};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct ServerArgs {
    pub dns_port: u16,
    pub domains: Vec<String>,
    pub privkey_file: PathBuf,
    pub target: TargetDialer,
    pub options: ServerOptions,
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    if args.domains.is_empty() {
        bail!("at least one tunnel domain is required");
    }
    let domains: Vec<String> = args
        .domains
        .iter()
        .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
        .collect();
    for d in &domains {
        log::info!("registered tunnel domain {d}");
    }

    let key_pair = crate::keys::load_private_key(&args.privkey_file)
        .with_context(|| format!("failed to load private key {}", args.privkey_file.display()))?;
    let tls = crate::keys::server_tls_config(&key_pair)?;

    let sessions = Arc::new(SessionManager::new(args.options.session_manager_config()));
    let conduit = Arc::new(VirtualConn::new(Arc::clone(&sessions), &args.options));
    let handler = Arc::new(DnsHandler::new(
        Arc::clone(&sessions),
        Arc::clone(&conduit),
        &domains,
        args.options.max_frags_per_response,
    ));

    let dns_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, args.dns_port));
    let dns_socket = Arc::new(
        UdpSocket::bind(dns_addr)
            .await
            .with_context(|| format!("failed to bind DNS socket on {dns_addr}"))?,
    );
    log::info!("DNS server listening on {dns_addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&handler).run(Arc::clone(&dns_socket), shutdown_rx));

    let sweep_sessions = Arc::clone(&sessions);
    let sweep_interval = args.options.session_sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            sweep_sessions.evict_expired();
        }
    });

    let endpoint = Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        Some(server_quic_config(tls)?),
        Arc::clone(&conduit) as Arc<dyn quinn::AsyncUdpSocket>,
        Arc::new(TokioRuntime),
    )?;
    log::info!("QUIC listener started on virtual connection");

    while let Some(incoming) = endpoint.accept().await {
        // Force address validation via Retry for every new connection.
        // Without it the anti-amplification cap (3x the first flight)
        // deadlocks the handshake: the certificate exchange outgrows the
        // cap while the acks that would lift it get lost in the DNS
        // substrate.
        if !incoming.remote_address_validated() {
            if let Err(err) = incoming.retry() {
                log::debug!("retry dispatch failed: {err}");
            }
            continue;
        }

        let connecting = match incoming.accept() {
            Ok(connecting) => connecting,
            Err(err) => {
                log::debug!("failed to accept incoming connection: {err}");
                continue;
            }
        };
        let dialer = args.target.clone();
        tokio::spawn(async move {
            match connecting.await {
                Ok(connection) => handle_connection(connection, dialer).await,
                Err(err) => log::debug!("QUIC handshake failed: {err}"),
            }
        });
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// quinn server configuration tuned for the DNS substrate: long idle
/// window, frequent keepalives, and no PMTU probing.
fn server_quic_config(tls: rustls::ServerConfig) -> Result<quinn::ServerConfig> {
    let crypto =
        QuicServerConfig::try_from(tls).context("TLS configuration rejected by quinn")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(35)));
    transport.max_idle_timeout(Some(
        Duration::from_secs(5 * 60)
            .try_into()
            .expect("idle timeout in VarInt range"),
    ));
    transport.max_concurrent_bidi_streams(1000u32.into());
    transport.max_concurrent_uni_streams(1000u32.into());
    transport.stream_receive_window((6u32 * 1024 * 1024).into());
    transport.receive_window((15u32 * 1024 * 1024).into());
    transport.mtu_discovery_config(None);
    config.transport_config(Arc::new(transport));

    Ok(config)
}

async fn handle_connection(connection: Connection, dialer: TargetDialer) {
    log::info!("new QUIC connection from {}", connection.remote_address());
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let dialer = dialer.clone();
                tokio::spawn(handle_stream(send, recv, dialer));
            }
            Err(err) => {
                log::debug!("connection closed: {err}");
                return;
            }
        }
    }
}

/// One tunnel stream: read the target header, dial, report one status
/// byte, then pipe bytes both ways until either side finishes.
async fn handle_stream(mut send: SendStream, mut recv: RecvStream, dialer: TargetDialer) {
    let target = match socks::read_target_address(&mut recv).await {
        Ok(target) => target,
        Err(err) => {
            log::error!("failed to parse target address: {err}");
            let _ = send.write_all(&[0x01]).await;
            return;
        }
    };

    log::debug!("connecting to target {target}");
    let mut upstream = match dialer.dial(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("failed to connect to {target}: {err}");
            let _ = send.write_all(&[0x01]).await;
            return;
        }
    };

    if let Err(err) = send.write_all(&[0x00]).await {
        log::debug!("failed to send connect status: {err}");
        return;
    }
    log::debug!("connected to {target}, piping data");

    let (mut up_read, mut up_write) = upstream.split();
    tokio::select! {
        res = tokio::io::copy(&mut recv, &mut up_write) => {
            if let Ok(n) = res {
                log::debug!("tunnel->{target} closed after {n} bytes");
            }
        }
        res = tokio::io::copy(&mut up_read, &mut send) => {
            if let Ok(n) = res {
                log::debug!("{target}->tunnel closed after {n} bytes");
            }
        }
    }
}
