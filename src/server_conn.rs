//! Server-side virtual socket bridging the DNS handler and the QUIC engine.
//!
//! The QUIC listener believes it owns a UDP socket; in reality its inbound
//! packets are reassembled out of DNS queries and its outbound packets are
//! pre-fragmented into per-session queues that DNS responses drain later.
//! Peers are identified by [`SessionAddr`]s, which look like UDP addresses
//! to the engine but carry a session id.

use crate::config::ServerOptions;
use crate::fragment::fragment_datagram;
use crate::session::{SessionAddr, SessionManager};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub struct VirtualConn {
    sessions: Arc<SessionManager>,
    incoming_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    incoming_rx: StdMutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    max_chunk: usize,
    redundancy_threshold: usize,
}

impl VirtualConn {
    pub fn new(sessions: Arc<SessionManager>, opts: &ServerOptions) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(opts.incoming_queue_size);
        Self {
            sessions,
            incoming_tx,
            incoming_rx: StdMutex::new(incoming_rx),
            max_chunk: crate::fragment::MAX_CHUNK,
            redundancy_threshold: 1000,
        }
    }

    /// Hand a reassembled upstream datagram to the QUIC engine, tagged with
    /// its session. Called by the DNS handler; drops when the engine is not
    /// keeping up, since the client will retransmit.
    pub fn inject(&self, datagram: Vec<u8>, session_id: &str) {
        let addr = SessionAddr::new(session_id).socket_addr();
        match self.incoming_tx.try_send((datagram, addr)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("incoming queue full, dropping packet for session {session_id}");
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("incoming queue closed, dropping packet for session {session_id}");
            }
        }
    }
}

impl fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConn")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl AsyncUdpSocket for VirtualConn {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(QueuePoller)
    }

    fn may_fragment(&self) -> bool {
        false
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    /// Outbound QUIC packet: resolve the session from the synthetic peer
    /// address, fragment, and queue for the next DNS responses. Handshake
    /// flights get the same 2x duplication as the client applies upstream.
    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let Some(addr) = SessionAddr::from_socket_addr(&transmit.destination) else {
            log::error!(
                "QUIC engine sent to non-session address {}",
                transmit.destination
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination is not a session address",
            ));
        };

        let session = self.sessions.get_or_create(addr.id());
        let chunks = match fragment_datagram(transmit.contents, self.max_chunk) {
            Ok(chunks) => chunks,
            Err(err) => {
                log::debug!("dropping unfragmentable packet for {addr}: {err}");
                return Ok(());
            }
        };

        let copies = if transmit.contents.len() >= self.redundancy_threshold {
            log::debug!(
                "applying 2x redundancy for {}-byte packet to {addr}",
                transmit.contents.len()
            );
            2
        } else {
            1
        };

        for _ in 0..copies {
            for chunk in &chunks {
                if !session.frag_queue.push(chunk.clone()) {
                    log::debug!("frag queue full for session {addr}, dropping fragment");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        metas: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut rx = self.incoming_rx.lock().unwrap();
        match rx.poll_recv(cx) {
            Poll::Ready(Some((data, addr))) => {
                if bufs.is_empty() || metas.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let len = data.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&data[..len]);
                metas[0] = RecvMeta {
                    len,
                    stride: len,
                    addr,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "conduit closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        // Spoofed; the engine only uses this for logging and src hints.
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53))
    }
}

#[derive(Debug)]
struct QueuePoller;

impl UdpPoller for QueuePoller {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
