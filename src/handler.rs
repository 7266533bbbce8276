//! Server DNS front door.
//!
//! Every packet the server sees is a DNS query from some recursor. The
//! handler validates the name against the registered tunnel domains,
//! routes chunk payloads into the right session's reassembler, and packs
//! pending downstream chunks into TXT answers on the way out. A query is
//! answered even when there is nothing to say: an empty NOERROR keeps the
//! client's RX loop ticking.

use crate::dns::{self, DnsMessage, QueryPayload};
use crate::server_conn::VirtualConn;
use crate::session::SessionManager;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct DnsHandler {
    sessions: Arc<SessionManager>,
    conduit: Arc<VirtualConn>,
    /// Lower-cased, no trailing dots. Never empty.
    allowed_domains: Vec<String>,
    max_frags: usize,
}

impl DnsHandler {
    pub fn new(
        sessions: Arc<SessionManager>,
        conduit: Arc<VirtualConn>,
        domains: &[String],
        max_frags: usize,
    ) -> Self {
        let allowed_domains = domains
            .iter()
            .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            sessions,
            conduit,
            allowed_domains,
            max_frags: if max_frags == 0 { 6 } else { max_frags },
        }
    }

    /// Serve queries on `socket` until shutdown.
    pub async fn run(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("DNS socket read failed: {err}");
                        continue;
                    }
                },
            };

            if let Some(reply) = self.handle_query(&buf[..n]) {
                if let Err(err) = socket.send_to(&reply, peer).await {
                    log::debug!("DNS reply to {peer} failed: {err}");
                }
            }
        }
    }

    /// Process one query datagram; returns the reply to send, if any.
    pub fn handle_query(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match DnsMessage::parse(packet) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("dropping malformed DNS query: {err}");
                return None;
            }
        };

        if query.header.is_response() || query.questions.len() != 1 {
            return None;
        }
        let qname = query.question()?.qname.clone();
        let qname_lower = qname.to_ascii_lowercase();

        let Some(domain) = self.match_domain(&qname_lower) else {
            log::warn!("rejected query for unregistered domain: {qname_lower}");
            return dns::encode_refused(&query)
                .map_err(|err| log::debug!("failed to build REFUSED reply: {err}"))
                .ok();
        };

        // [data-label ...].[session].[domain]
        let labels: Vec<&str> = qname_lower.split('.').collect();
        let domain_label_count = domain.split('.').count();
        if labels.len() < domain_label_count + 2 {
            return None;
        }
        let session_idx = labels.len() - domain_label_count - 1;
        let session_id = labels[session_idx].to_string();
        let data_prefix: String = labels[..session_idx].concat();

        let session = self.sessions.get_or_create(&session_id);

        match dns::decode_query_payload(&data_prefix) {
            Ok(QueryPayload::Poll) => {
                log::debug!("poll from session {session_id}");
            }
            Ok(QueryPayload::Chunk(raw)) => {
                let complete = session.reassembler.lock().unwrap().ingest(&raw);
                if let Some(datagram) = complete {
                    log::debug!(
                        "upstream datagram complete for {session_id} ({} bytes)",
                        datagram.len()
                    );
                    self.conduit.inject(datagram, &session_id);
                }
            }
            Err(err) => {
                // Not fatal for the exchange: the reply below still drains
                // the downstream queue.
                log::debug!("undecodable data labels from {session_id}: {err}");
            }
        }

        let chunks = session.frag_queue.drain(self.max_frags);
        if !chunks.is_empty() {
            log::debug!("packing {} fragments for {session_id}", chunks.len());
        }
        dns::encode_reply(&query, &chunks)
            .map_err(|err| log::debug!("failed to build reply: {err}"))
            .ok()
    }

    /// Longest registered domain that is the query name or one of its
    /// label-aligned suffixes.
    fn match_domain(&self, qname_lower: &str) -> Option<&str> {
        self.allowed_domains
            .iter()
            .filter(|d| {
                qname_lower == d.as_str() || qname_lower.ends_with(&format!(".{d}"))
            })
            .max_by_key(|d| d.len())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::dns::message::TYPE_TXT;
    use crate::fragment::fragment_datagram;
    use crate::session::{SessionAddr, SessionManagerConfig};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use quinn::udp::RecvMeta;
    use std::future::poll_fn;
    use std::io::IoSliceMut;
    use std::time::Duration;

    fn handler_with(domains: &[&str], max_frags: usize) -> (Arc<SessionManager>, Arc<VirtualConn>, DnsHandler) {
        let sessions = Arc::new(SessionManager::new(SessionManagerConfig {
            dup_window: Duration::from_millis(80),
            ..Default::default()
        }));
        let conduit = Arc::new(VirtualConn::new(
            Arc::clone(&sessions),
            &ServerOptions::default(),
        ));
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let handler = DnsHandler::new(
            Arc::clone(&sessions),
            Arc::clone(&conduit),
            &domains,
            max_frags,
        );
        (sessions, conduit, handler)
    }

    async fn recv_injected(conduit: &VirtualConn) -> (Vec<u8>, std::net::SocketAddr) {
        use quinn::AsyncUdpSocket;
        let mut storage = [0u8; 4096];
        let mut meta = [RecvMeta::default()];
        let n = poll_fn(|cx| {
            let mut bufs = [IoSliceMut::new(&mut storage)];
            conduit.poll_recv(cx, &mut bufs, &mut meta)
        })
        .await
        .unwrap();
        assert_eq!(n, 1);
        (storage[..meta[0].len].to_vec(), meta[0].addr)
    }

    fn data_query(chunk: &[u8], session: &str, domain: &str) -> Vec<u8> {
        dns::encode_data_query(chunk, session, domain).unwrap()
    }

    #[tokio::test]
    async fn single_chunk_upstream_injects_datagram() {
        let (_, conduit, handler) = handler_with(&["n.example.com"], 5);

        let datagram = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let chunks = fragment_datagram(&datagram, 124).unwrap();
        assert_eq!(chunks.len(), 1);

        let reply = handler
            .handle_query(&data_query(&chunks[0], "abcd1234", "n.example.com"))
            .expect("reply expected");
        let parsed = DnsMessage::parse(&reply).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.rcode(), 0);
        assert!(parsed.answers.is_empty());

        let (data, addr) = recv_injected(&conduit).await;
        assert_eq!(data, datagram);
        assert_eq!(
            SessionAddr::from_socket_addr(&addr),
            Some(SessionAddr::new("abcd1234"))
        );
    }

    #[tokio::test]
    async fn reordered_chunks_inject_once() {
        let (_, conduit, handler) = handler_with(&["n.example.com"], 5);

        let datagram: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let chunks = fragment_datagram(&datagram, 124).unwrap();
        assert_eq!(chunks.len(), 3);

        for idx in [2usize, 0, 1] {
            handler.handle_query(&data_query(&chunks[idx], "abcd1234", "n.example.com"));
        }
        let (data, _) = recv_injected(&conduit).await;
        assert_eq!(data, datagram);

        // Replay of a chunk after completion must not inject again.
        handler.handle_query(&data_query(&chunks[1], "abcd1234", "n.example.com"));
        let extra = tokio::time::timeout(
            Duration::from_millis(50),
            recv_injected(&conduit),
        )
        .await;
        assert!(extra.is_err(), "duplicate injection observed");
    }

    #[tokio::test]
    async fn poll_drains_at_most_max_frags() {
        let (sessions, _, handler) = handler_with(&["n.example.com"], 5);

        let session = sessions.get_or_create("abcd1234");
        for i in 0..8u8 {
            session.frag_queue.push(vec![i; 10]);
        }

        let poll = dns::encode_poll_query("abcd1234", "n.example.com").unwrap();
        let first = DnsMessage::parse(&handler.handle_query(&poll).unwrap()).unwrap();
        assert_eq!(first.answers.len(), 5);
        assert_eq!(first.answers[0].rtype, TYPE_TXT);
        assert_eq!(
            BASE64.decode(first.answers[0].txt_data().unwrap()).unwrap(),
            vec![0u8; 10]
        );

        let poll = dns::encode_poll_query("abcd1234", "n.example.com").unwrap();
        let second = DnsMessage::parse(&handler.handle_query(&poll).unwrap()).unwrap();
        assert_eq!(second.answers.len(), 3);

        let poll = dns::encode_poll_query("abcd1234", "n.example.com").unwrap();
        let third = DnsMessage::parse(&handler.handle_query(&poll).unwrap()).unwrap();
        assert!(third.answers.is_empty());
        assert_eq!(third.header.rcode(), 0);
    }

    #[tokio::test]
    async fn unregistered_domain_is_refused_without_session() {
        let (sessions, _, handler) = handler_with(&["n.example.com"], 5);

        let query = data_query(b"\x00\x01\x01\x00X", "sess", "evil.example.net");
        let reply = DnsMessage::parse(&handler.handle_query(&query).unwrap()).unwrap();
        assert_eq!(reply.header.rcode(), 5);
        assert!(reply.answers.is_empty());
        assert!(sessions.get("sess").is_none());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn uppercase_session_labels_match_case_insensitively() {
        let (sessions, _, handler) = handler_with(&["n.example.com"], 5);

        // A recursor may rewrite label case in flight.
        let chunk = fragment_datagram(b"hi", 124).unwrap().remove(0);
        let packet = data_query(&chunk, "ABCD1234", "N.EXAMPLE.COM");
        assert!(handler.handle_query(&packet).is_some());
        assert!(sessions.get("abcd1234").is_some());
    }

    #[tokio::test]
    async fn duplicate_window_expiry_reopens_reassembly() {
        let (sessions, conduit, handler) = handler_with(&["n.example.com"], 5);

        let datagram = vec![7u8; 200];
        let chunks = fragment_datagram(&datagram, 124).unwrap();
        for c in &chunks {
            handler.handle_query(&data_query(c, "abcd1234", "n.example.com"));
        }
        let _ = recv_injected(&conduit).await;

        // Inside the (shortened) window: suppressed, no pending state.
        handler.handle_query(&data_query(&chunks[0], "abcd1234", "n.example.com"));
        let session = sessions.get("abcd1234").unwrap();
        assert_eq!(session.reassembler.lock().unwrap().pending_count(), 0);

        // Past the window: the replayed chunk opens a fresh (and forever
        // incomplete) reassembly.
        tokio::time::sleep(Duration::from_millis(120)).await;
        handler.handle_query(&data_query(&chunks[0], "abcd1234", "n.example.com"));
        assert_eq!(session.reassembler.lock().unwrap().pending_count(), 1);
    }

    #[tokio::test]
    async fn multi_question_and_garbage_ignored() {
        let (_, _, handler) = handler_with(&["n.example.com"], 5);
        assert!(handler.handle_query(b"not dns").is_none());

        // A response must not be treated as a query.
        let poll = dns::encode_poll_query("abcd1234", "n.example.com").unwrap();
        let reply = handler.handle_query(&poll).unwrap();
        assert!(handler.handle_query(&reply).is_none());
    }

    #[tokio::test]
    async fn longest_domain_wins_overlap() {
        let (sessions, _, handler) = handler_with(&["example.com", "n.example.com"], 5);
        let poll = dns::encode_poll_query("abcd1234", "n.example.com").unwrap();
        handler.handle_query(&poll).unwrap();
        // With the longer suffix matched, the label before it is the session.
        assert!(sessions.get("abcd1234").is_some());
    }
}
