//! Client runtime: local SOCKS5 proxy in front of the tunnel.

use crate::config::TunnelOptions;
use crate::socks::{self, Command, ReplyCode};
use crate::tunnel::{client_quic_config, TunnelManager};
use anyhow::{bail, Context as _, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ClientArgs {
    pub listen: String,
    pub resolver: String,
    pub domain: String,
    pub pubkey_file: PathBuf,
    pub tunnel: TunnelOptions,
}

pub async fn run_client(args: ClientArgs) -> Result<()> {
    let public_key = crate::keys::load_public_key(&args.pubkey_file)
        .with_context(|| format!("failed to load public key {}", args.pubkey_file.display()))?;
    let pin = crate::keys::fingerprint(&public_key);
    log::info!("pinning server key fingerprint {pin}");

    let resolver = resolve_addr(&args.resolver)
        .await
        .with_context(|| format!("cannot resolve resolver address {}", args.resolver))?;

    let domain = args.domain.trim_end_matches('.').to_ascii_lowercase();
    let capacity = crate::dns::max_chunk_for_domain(&domain);
    if capacity < args.tunnel.max_chunk + crate::fragment::FRAG_HEADER_LEN {
        bail!(
            "domain {domain} leaves only {capacity} bytes per query; \
             lower max_chunk below {}",
            capacity.saturating_sub(crate::fragment::FRAG_HEADER_LEN)
        );
    }

    let quic_config = client_quic_config(crate::keys::client_tls_config(pin))?;
    let tunnel = Arc::new(TunnelManager::new(
        resolver,
        &domain,
        args.tunnel,
        quic_config,
    ));

    // The first dial is fatal on failure; later losses feed the
    // reconnect loop instead.
    tunnel
        .connect()
        .await
        .context("initial tunnel connection failed")?;
    tunnel.spawn_liveness_watcher();

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind SOCKS5 listener on {}", args.listen))?;
    log::info!("SOCKS5 proxy listening on {}", args.listen);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                log::error!("accept failed: {err}");
                continue;
            }
        };
        log::debug!("SOCKS5 connection from {peer}");
        let tunnel = Arc::clone(&tunnel);
        tokio::spawn(async move {
            if let Err(err) = handle_socks_connection(stream, tunnel).await {
                log::debug!("SOCKS5 connection from {peer} ended: {err}");
            }
        });
    }
}

async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .with_context(|| format!("no addresses for {addr}"))
}

/// Bridge one local SOCKS5 connection onto a fresh tunnel stream.
async fn handle_socks_connection(
    mut stream: TcpStream,
    tunnel: Arc<TunnelManager>,
) -> Result<()> {
    let (command, target) = socks::socks5_handshake(&mut stream).await?;
    if command != Command::Connect {
        socks::send_reply(&mut stream, ReplyCode::CommandNotSupported, None).await?;
        bail!("unsupported SOCKS5 command {command:?}");
    }

    if !tunnel.is_connected() {
        log::warn!("tunnel down, rejecting SOCKS5 request for {target}");
        socks::send_reply(&mut stream, ReplyCode::GeneralFailure, None).await?;
        return Ok(());
    }
    let Some(connection) = tunnel.connection().await else {
        socks::send_reply(&mut stream, ReplyCode::GeneralFailure, None).await?;
        return Ok(());
    };

    let opened = tokio::time::timeout(STREAM_OPEN_TIMEOUT, connection.open_bi()).await;
    let (mut send, mut recv) = match opened {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            log::error!("failed to open tunnel stream: {err}");
            socks::send_reply(&mut stream, ReplyCode::GeneralFailure, None).await?;
            // Stream-open failure usually means the connection is gone.
            tunnel.spawn_reconnect();
            return Ok(());
        }
        Err(_) => {
            log::error!("tunnel stream open timed out");
            socks::send_reply(&mut stream, ReplyCode::GeneralFailure, None).await?;
            tunnel.spawn_reconnect();
            return Ok(());
        }
    };

    socks::write_target_address(&mut send, &target).await?;

    // One status byte from the server: 0x00 connected, anything else failed.
    let mut status = [0u8; 1];
    if let Err(err) = recv.read_exact(&mut status).await {
        log::error!("no connect status from server: {err}");
        socks::send_reply(&mut stream, ReplyCode::GeneralFailure, None).await?;
        return Ok(());
    }
    if status[0] != 0x00 {
        log::debug!("server could not reach {target}");
        socks::send_reply(&mut stream, ReplyCode::ConnectionRefused, None).await?;
        return Ok(());
    }

    socks::send_reply(&mut stream, ReplyCode::Succeeded, None).await?;
    log::debug!("SOCKS5 tunnel established to {target}");

    let (mut tcp_read, mut tcp_write) = stream.split();
    tokio::select! {
        res = tokio::io::copy(&mut tcp_read, &mut send) => {
            if let Ok(n) = res {
                log::debug!("client->tunnel closed after {n} bytes");
            }
        }
        res = tokio::io::copy(&mut recv, &mut tcp_write) => {
            if let Ok(n) = res {
                log::debug!("tunnel->client closed after {n} bytes");
            }
        }
    }

    Ok(())
}
