//! Tunnel configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client adapter knobs. Defaults match the tested production posture;
/// most deployments only ever change the resolver and domain, which travel
/// separately on the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Workers draining the chunk queue into DNS queries.
    pub num_tx_workers: usize,

    /// Steady poll heartbeat.
    pub poll_interval_ms: u64,

    /// Only poll when nothing was transmitted for this long.
    pub idle_threshold_ms: u64,

    /// Polls fired per burst. Each poll pulls up to `max_frags` chunks, so
    /// this is the downstream window per round trip.
    pub parallel_polls: usize,

    /// How long an enqueue may wait before the datagram is dropped.
    pub write_timeout_ms: u64,

    /// Reassembled-datagram queue bound.
    pub rx_queue_size: usize,

    /// Outbound chunk queue bound.
    pub tx_queue_size: usize,

    /// Payload bytes per chunk (header excluded).
    pub max_chunk: usize,

    /// Datagrams at least this large are queued twice; in practice these
    /// are the Initial/Handshake flights.
    pub handshake_redundancy_threshold: usize,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            num_tx_workers: 32,
            poll_interval_ms: 25,
            idle_threshold_ms: 100,
            parallel_polls: 8,
            write_timeout_ms: 5000,
            rx_queue_size: 2000,
            tx_queue_size: 2000,
            max_chunk: crate::fragment::MAX_CHUNK,
            handshake_redundancy_threshold: 1000,
        }
    }
}

impl TunnelOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Server-side knobs for the DNS handler and session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// TXT answers packed per response. The main downstream-throughput
    /// lever: more answers per poll means fewer round trips.
    pub max_frags_per_response: usize,

    /// Session lifetime from last access.
    pub session_ttl_secs: u64,

    /// Sweep cadence for expired sessions.
    pub session_sweep_interval_secs: u64,

    /// Downstream chunk queue bound per session.
    pub frag_queue_size: usize,

    /// Duplicate-suppression window for completed packet ids.
    pub dup_window_secs: u64,

    /// Pending-reassembly map cap before a wholesale flush.
    pub pending_gc_cap: usize,

    /// Reassembled-packet queue bound between DNS handler and QUIC engine.
    pub incoming_queue_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_frags_per_response: 6,
            session_ttl_secs: 5 * 60,
            session_sweep_interval_secs: 10 * 60,
            frag_queue_size: crate::session::FRAG_QUEUE_SIZE,
            dup_window_secs: 30,
            pending_gc_cap: crate::fragment::PENDING_GC_CAP,
            incoming_queue_size: 1000,
        }
    }
}

impl ServerOptions {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    pub fn dup_window(&self) -> Duration {
        Duration::from_secs(self.dup_window_secs)
    }

    pub fn session_manager_config(&self) -> crate::session::SessionManagerConfig {
        crate::session::SessionManagerConfig {
            ttl: self.session_ttl(),
            frag_queue_size: self.frag_queue_size,
            dup_window: self.dup_window(),
            pending_gc_cap: self.pending_gc_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let opts = TunnelOptions::default();
        assert!(opts.num_tx_workers >= 4 && opts.num_tx_workers <= 32);
        assert!(opts.poll_interval() < opts.idle_threshold());
        // A max-size chunk must fit a DNS query for a short tunnel domain.
        assert!(
            crate::dns::max_chunk_for_domain("n.example.com")
                >= opts.max_chunk + crate::fragment::FRAG_HEADER_LEN
        );

        let server = ServerOptions::default();
        assert!(server.max_frags_per_response >= 5 && server.max_frags_per_response <= 10);
        assert!(server.session_ttl() < server.session_sweep_interval());
    }
}
