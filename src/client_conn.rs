//! Client-side DNS transport presented to quinn as a UDP socket.
//!
//! [`DnsPacketConn`] implements `quinn::AsyncUdpSocket`, so an unmodified
//! QUIC endpoint drives it exactly like a datagram socket. Underneath,
//! outbound packets are fragmented and mailed to a recursive resolver as
//! TXT queries, while inbound packets arrive as TXT answers and are
//! reassembled before being surfaced to the engine.
//!
//! A DNS recursor only ever answers questions, so downstream data must be
//! pulled. Two cooperating pollers keep the pipe drained:
//! - a steady timer that polls whenever the engine has been quiet, and
//! - a burst engine that fires the moment a response actually carried
//!   data, on the theory that more is queued right behind it.

use crate::config::TunnelOptions;
use crate::dns::{self, DnsMessage};
use crate::fragment::{fragment_datagram, Reassembler};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::sleep;

/// Placeholder peer handed to quinn. The engine needs *some* UDP address
/// to dial and to attribute received datagrams to; this one never sees a
/// real packet.
pub fn dummy_peer_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234)
}

/// DNS-backed datagram socket for the client side of the tunnel.
pub struct DnsPacketConn {
    socket: Arc<UdpSocket>,
    session_id: String,
    domain: String,
    datagram_tx: mpsc::UnboundedSender<Vec<u8>>,
    rx_queue: StdMutex<mpsc::Receiver<Vec<u8>>>,
    last_tx: Arc<StdMutex<Instant>>,
    shutdown: watch::Sender<bool>,
}

impl DnsPacketConn {
    /// Bind a socket to `resolver` and start the transport engines:
    /// a fragmenting dispatcher, the TX worker pool, the RX loop, and the
    /// two poll engines.
    pub async fn new(
        resolver: SocketAddr,
        domain: &str,
        session_id: &str,
        opts: TunnelOptions,
    ) -> io::Result<Self> {
        let bind_addr: SocketAddr = if resolver.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(opts.tx_queue_size);
        let (rx_tx, rx_rx) = mpsc::channel::<Vec<u8>>(opts.rx_queue_size);
        // Capacity 1: repeated triggers while a burst is in flight coalesce
        // into a single pending signal.
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown, _) = watch::channel(false);

        let last_tx = Arc::new(StdMutex::new(Instant::now()));

        spawn_dispatcher(
            datagram_rx,
            chunk_tx,
            opts.clone(),
            shutdown.subscribe(),
        );

        let chunk_rx = Arc::new(AsyncMutex::new(chunk_rx));
        for _ in 0..opts.num_tx_workers.max(1) {
            spawn_tx_worker(
                Arc::clone(&chunk_rx),
                Arc::clone(&socket),
                resolver,
                session_id.to_string(),
                domain.to_string(),
            );
        }

        spawn_rx_loop(
            Arc::clone(&socket),
            rx_tx,
            trigger_tx,
            shutdown.subscribe(),
        );

        spawn_steady_poll(
            Arc::clone(&socket),
            resolver,
            session_id.to_string(),
            domain.to_string(),
            opts.clone(),
            Arc::clone(&last_tx),
            shutdown.subscribe(),
        );

        spawn_burst_poll(
            trigger_rx,
            Arc::clone(&socket),
            resolver,
            session_id.to_string(),
            domain.to_string(),
            opts.parallel_polls,
            shutdown.subscribe(),
        );

        Ok(Self {
            socket,
            session_id: session_id.to_string(),
            domain: domain.to_string(),
            datagram_tx,
            rx_queue: StdMutex::new(rx_rx),
            last_tx,
            shutdown,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Stop every engine. Safe to call more than once; pending `poll_recv`
    /// callers observe a closed socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for DnsPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DnsPacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsPacketConn")
            .field("session_id", &self.session_id)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl AsyncUdpSocket for DnsPacketConn {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(QueuePoller)
    }

    fn may_fragment(&self) -> bool {
        false
    }

    fn max_transmit_segments(&self) -> usize {
        // One DNS query per QUIC datagram; no GSO batching.
        1
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        *self.last_tx.lock().unwrap() = Instant::now();
        self.datagram_tx
            .send(transmit.contents.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        metas: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut rx = self.rx_queue.lock().unwrap();
        match rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if bufs.is_empty() || metas.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let len = data.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&data[..len]);
                metas[0] = RecvMeta {
                    len,
                    stride: len,
                    addr: dummy_peer_addr(),
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[derive(Debug)]
struct QueuePoller;

impl UdpPoller for QueuePoller {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        // Sends only enqueue; the queue applies its own backpressure by
        // dropping, so the engine may always write.
        Poll::Ready(Ok(()))
    }
}

/// Fragments outbound datagrams and feeds the bounded chunk queue.
///
/// Large datagrams are the QUIC handshake flights; losing one costs a full
/// RTO, so they are queued twice with pacing between chunks. Recursors
/// drop bursts far more often than they drop spaced packets.
fn spawn_dispatcher(
    mut datagram_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    opts: TunnelOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let datagram = tokio::select! {
                _ = shutdown.changed() => break,
                d = datagram_rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };

            let chunks = match fragment_datagram(&datagram, opts.max_chunk) {
                Ok(chunks) => chunks,
                Err(err) => {
                    log::debug!("dropping unfragmentable datagram: {err}");
                    continue;
                }
            };

            let copies = if datagram.len() >= opts.handshake_redundancy_threshold {
                2
            } else {
                1
            };

            'datagram: for round in 0..copies {
                for chunk in &chunks {
                    match chunk_tx
                        .send_timeout(chunk.clone(), opts.write_timeout())
                        .await
                    {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            log::warn!("TX queue full, dropping datagram");
                            break 'datagram;
                        }
                        Err(SendTimeoutError::Closed(_)) => return,
                    }
                    if copies > 1 {
                        sleep(std::time::Duration::from_millis(2)).await;
                    }
                }
                if round + 1 < copies {
                    sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    });
}

/// One of N workers draining the chunk queue into DNS queries.
fn spawn_tx_worker(
    chunk_rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
    socket: Arc<UdpSocket>,
    resolver: SocketAddr,
    session_id: String,
    domain: String,
) {
    tokio::spawn(async move {
        loop {
            let chunk = { chunk_rx.lock().await.recv().await };
            let Some(chunk) = chunk else { break };

            match dns::encode_data_query(&chunk, &session_id, &domain) {
                Ok(query) => {
                    if let Err(err) = socket.send_to(&query, resolver).await {
                        // Keep going; QUIC retransmits whatever was lost.
                        log::warn!("resolver write failed: {err}");
                    }
                }
                Err(err) => log::debug!("chunk does not fit a query: {err}"),
            }
        }
    });
}

/// Single reader on the resolver socket. Completed datagrams go to the RX
/// queue; any response that carried data raises the burst-poll signal.
fn spawn_rx_loop(
    socket: Arc<UdpSocket>,
    rx_tx: mpsc::Sender<Vec<u8>>,
    trigger_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut reassembler = Reassembler::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, _)) => n,
                    Err(err) => {
                        log::debug!("resolver read failed: {err}");
                        continue;
                    }
                },
            };

            let msg = match DnsMessage::parse(&buf[..n]) {
                Ok(msg) => msg,
                Err(err) => {
                    log::debug!("failed to parse DNS response: {err}");
                    continue;
                }
            };

            let mut got_data = false;
            for raw in dns::decode_txt_payloads(&msg) {
                if raw.is_empty() {
                    continue;
                }
                got_data = true;
                if let Some(datagram) = reassembler.ingest(&raw) {
                    log::debug!("downstream datagram complete ({} bytes)", datagram.len());
                    match rx_tx.try_send(datagram) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            log::warn!("RX queue full, dropping datagram")
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }

            if got_data {
                // Coalesced: a send onto the full slot means a burst is
                // already pending.
                let _ = trigger_tx.try_send(());
            }
        }
    });
}

/// Heartbeat poller: when the engine has been idle past the threshold,
/// pull whatever the server queued.
fn spawn_steady_poll(
    socket: Arc<UdpSocket>,
    resolver: SocketAddr,
    session_id: String,
    domain: String,
    opts: TunnelOptions,
    last_tx: Arc<StdMutex<Instant>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(opts.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let idle = last_tx.lock().unwrap().elapsed() > opts.idle_threshold();
                    if idle {
                        send_polls(&socket, resolver, &session_id, &domain, opts.parallel_polls).await;
                    }
                }
            }
        }
    });
}

/// Consumes the burst signal: the server just produced data, so ask for
/// more immediately instead of waiting out the steady tick.
fn spawn_burst_poll(
    mut trigger_rx: mpsc::Receiver<()>,
    socket: Arc<UdpSocket>,
    resolver: SocketAddr,
    session_id: String,
    domain: String,
    parallel_polls: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                sig = trigger_rx.recv() => {
                    if sig.is_none() {
                        break;
                    }
                    send_polls(&socket, resolver, &session_id, &domain, parallel_polls).await;
                }
            }
        }
    });
}

/// Fire `count` cache-busted polls, pausing 1 ms every 8 to keep the UDP
/// send buffer from overflowing.
async fn send_polls(
    socket: &UdpSocket,
    resolver: SocketAddr,
    session_id: &str,
    domain: &str,
    count: usize,
) {
    for i in 0..count {
        match dns::encode_poll_query(session_id, domain) {
            Ok(query) => {
                if let Err(err) = socket.send_to(&query, resolver).await {
                    log::debug!("poll write failed: {err}");
                    return;
                }
            }
            Err(err) => {
                log::debug!("failed to build poll query: {err}");
                return;
            }
        }
        if i > 0 && i % 8 == 0 {
            sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::TYPE_TXT;

    async fn bound_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let fake_resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (conn_socket, fake_resolver)
    }

    #[tokio::test]
    async fn polls_are_cache_busted_queries() {
        let (socket, resolver) = bound_pair().await;
        let resolver_addr = resolver.local_addr().unwrap();

        send_polls(&socket, resolver_addr, "abcd1234", "n.example.com", 3).await;

        let mut buf = [0u8; 512];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (n, _) = resolver.recv_from(&mut buf).await.unwrap();
            let msg = DnsMessage::parse(&buf[..n]).unwrap();
            let q = msg.question().unwrap();
            assert_eq!(q.qtype, TYPE_TXT);
            assert!(q.qname.starts_with("poll."));
            assert!(q.qname.ends_with(".abcd1234.n.example.com"));
            seen.push(q.qname.clone());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3, "each poll must carry a fresh nonce");
    }

    #[tokio::test]
    async fn adapter_sends_fragments_as_queries() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();

        let conn = DnsPacketConn::new(
            resolver_addr,
            "n.example.com",
            "abcd1234",
            TunnelOptions::default(),
        )
        .await
        .unwrap();

        let payload = vec![0x5au8; 300];
        conn.try_send(&Transmit {
            destination: dummy_peer_addr(),
            ecn: None,
            contents: &payload,
            segment_size: None,
            src_ip: None,
        })
        .unwrap();

        // 300 bytes at 124 per chunk -> 3 queries.
        let mut reassembler = Reassembler::new();
        let mut buf = [0u8; 1024];
        let mut rebuilt = None;
        for _ in 0..3 {
            let (n, _) = resolver.recv_from(&mut buf).await.unwrap();
            let msg = DnsMessage::parse(&buf[..n]).unwrap();
            let qname = &msg.question().unwrap().qname;
            let data_part = qname
                .strip_suffix(".abcd1234.n.example.com")
                .unwrap()
                .replace('.', "");
            match dns::decode_query_payload(&data_part).unwrap() {
                dns::QueryPayload::Chunk(raw) => {
                    if let Some(full) = reassembler.ingest(&raw) {
                        rebuilt = Some(full);
                    }
                }
                dns::QueryPayload::Poll => panic!("data query misread as poll"),
            }
        }
        assert_eq!(rebuilt, Some(payload));
        conn.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_breaks_recv() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = DnsPacketConn::new(
            resolver.local_addr().unwrap(),
            "n.example.com",
            "abcd1234",
            TunnelOptions::default(),
        )
        .await
        .unwrap();

        conn.close();
        conn.close();

        // Give the engines a moment to wind down; afterwards sends fail.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = conn
            .try_send(&Transmit {
                destination: dummy_peer_addr(),
                ecn: None,
                contents: b"x",
                segment_size: None,
                src_ip: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
