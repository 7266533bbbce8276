//! Server-side session state.
//!
//! A session is the rendezvous between one client tunnel and the server:
//! it owns the upstream reassembler and the queue of downstream chunks
//! waiting to be mailed out in DNS responses. Sessions are keyed by the
//! client-chosen 8-character id and silently age out after five minutes
//! without traffic.

use crate::fragment::Reassembler;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Session ids are exactly this many characters from `[a-z0-9]`.
pub const SESSION_ID_LEN: usize = 8;

/// Lifetime from last access.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// How often expired sessions are swept.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Downstream chunk queue bound per session.
pub const FRAG_QUEUE_SIZE: usize = 4000;

const SESSION_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh session id from the OS CSPRNG.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| SESSION_ID_CHARSET[*b as usize % SESSION_ID_CHARSET.len()] as char)
        .collect()
}

/// Bounded FIFO of downstream chunks. Enqueues past the bound are dropped;
/// QUIC regenerates the lost data through retransmission.
pub struct FragQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    cap: usize,
}

impl FragQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(64))),
            cap,
        }
    }

    /// Returns false when the queue was full and the chunk dropped.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.cap {
            return false;
        }
        q.push_back(chunk);
        true
    }

    /// Non-blocking drain of at most `max` chunks.
    pub fn drain(&self, max: usize) -> Vec<Vec<u8>> {
        let mut q = self.inner.lock().unwrap();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Session {
    pub id: String,
    pub reassembler: Mutex<Reassembler>,
    pub frag_queue: FragQueue,
    last_access: Mutex<Instant>,
}

impl Session {
    fn new(id: String, frag_queue_size: usize, dup_window: Duration, pending_cap: usize) -> Self {
        Self {
            id,
            reassembler: Mutex::new(Reassembler::with_limits(dup_window, pending_cap)),
            frag_queue: FragQueue::new(frag_queue_size),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }
}

/// Tuning knobs for the session store.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub ttl: Duration,
    pub frag_queue_size: usize,
    pub dup_window: Duration,
    pub pending_gc_cap: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            ttl: SESSION_TTL,
            frag_queue_size: FRAG_QUEUE_SIZE,
            dup_window: crate::fragment::DUP_WINDOW,
            pending_gc_cap: crate::fragment::PENDING_GC_CAP,
        }
    }
}

/// Concurrent session store with get-or-create semantics and TTL eviction.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Fetch the session for `id`, creating it on first sight. Every access
    /// refreshes the TTL. A single lock covers lookup and insert, so two
    /// concurrent calls for a new id cannot race into two sessions.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut map = self.sessions.lock().unwrap();
        let session = map.entry(id.to_string()).or_insert_with(|| {
            log::debug!("creating session {id}");
            Arc::new(Session::new(
                id.to_string(),
                self.config.frag_queue_size,
                self.config.dup_window,
                self.config.pending_gc_cap,
            ))
        });
        session.touch();
        Arc::clone(session)
    }

    /// Look up without creating; refreshes the TTL when found.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let map = self.sessions.lock().unwrap();
        let session = map.get(id)?;
        session.touch();
        Some(Arc::clone(session))
    }

    /// Drop every session idle past the TTL.
    pub fn evict_expired(&self) {
        let ttl = self.config.ttl;
        let mut map = self.sessions.lock().unwrap();
        map.retain(|id, session| {
            let keep = session.idle_for() <= ttl;
            if !keep {
                log::debug!("session {id} expired");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Synthetic peer identity handed to the QUIC engine in place of a real
/// UDP address.
///
/// quinn routes by `SocketAddr`, so the session id is embedded into a
/// unique-local IPv6 address: `fd00::/64` with the 8 ASCII id bytes as the
/// interface identifier. Two session addresses compare equal exactly when
/// their ids do, and the mapping is reversible on the send path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionAddr {
    id: String,
}

const SESSION_ADDR_PORT: u16 = 53;

impl SessionAddr {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `SocketAddr` form presented to quinn.
    pub fn socket_addr(&self) -> SocketAddr {
        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        let ascii = self.id.as_bytes();
        let start = 16 - ascii.len().min(8);
        octets[start..].copy_from_slice(&ascii[..ascii.len().min(8)]);
        SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), SESSION_ADDR_PORT)
    }

    /// Recover the session id from an address we previously fabricated.
    pub fn from_socket_addr(addr: &SocketAddr) -> Option<Self> {
        let IpAddr::V6(ip) = addr.ip() else {
            return None;
        };
        let octets = ip.octets();
        if octets[0] != 0xfd || octets[1..8] != [0u8; 7] {
            return None;
        }
        let id: String = octets[8..]
            .iter()
            .map(|b| *b as char)
            .collect();
        if id.len() != SESSION_ID_LEN
            || !id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return None;
        }
        Some(Self { id })
    }
}

impl std::fmt::Display for SessionAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn get_or_create_returns_same_session() {
        let mgr = SessionManager::new(SessionManagerConfig::default());
        let a = mgr.get_or_create("abcd1234");
        let b = mgr.get_or_create("abcd1234");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn sessions_expire_without_access() {
        let mgr = SessionManager::new(SessionManagerConfig {
            ttl: Duration::from_millis(30),
            ..Default::default()
        });
        mgr.get_or_create("abcd1234");
        mgr.evict_expired();
        assert_eq!(mgr.len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        mgr.evict_expired();
        assert!(mgr.is_empty());
    }

    #[test]
    fn access_refreshes_ttl() {
        let mgr = SessionManager::new(SessionManagerConfig {
            ttl: Duration::from_millis(80),
            ..Default::default()
        });
        mgr.get_or_create("abcd1234");
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(40));
            assert!(mgr.get("abcd1234").is_some());
        }
        mgr.evict_expired();
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn frag_queue_drops_on_full() {
        let q = FragQueue::new(3);
        assert!(q.push(vec![1]));
        assert!(q.push(vec![2]));
        assert!(q.push(vec![3]));
        assert!(!q.push(vec![4]));
        assert_eq!(q.drain(2), vec![vec![1], vec![2]]);
        assert_eq!(q.drain(5), vec![vec![3]]);
        assert!(q.is_empty());
    }

    #[test]
    fn session_addr_roundtrip() {
        let addr = SessionAddr::new("abcd1234");
        let sock = addr.socket_addr();
        assert!(sock.is_ipv6());
        assert_eq!(SessionAddr::from_socket_addr(&sock), Some(addr.clone()));
        assert_eq!(addr.to_string(), "abcd1234");

        assert_eq!(
            SessionAddr::new("abcd1234").socket_addr(),
            SessionAddr::new("abcd1234").socket_addr()
        );
        assert_ne!(
            SessionAddr::new("abcd1234").socket_addr(),
            SessionAddr::new("zzzz9999").socket_addr()
        );
    }

    #[test]
    fn foreign_addrs_do_not_map_to_sessions() {
        assert!(SessionAddr::from_socket_addr(&"127.0.0.1:53".parse().unwrap()).is_none());
        assert!(SessionAddr::from_socket_addr(&"[2001:db8::1]:53".parse().unwrap()).is_none());
    }
}
