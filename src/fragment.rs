//! Datagram fragmentation for DNS transport.
//!
//! A QUIC datagram is far larger than what fits in a single DNS query name,
//! so every datagram is split into numbered chunks before encoding. Each
//! chunk carries a fixed 4-byte header:
//!
//! ```text
//! +-----------+-------+-----+---------+
//! | packet_id | total | seq | payload |
//! |  u16 BE   |  u8   | u8  |  0..N   |
//! +-----------+-------+-----+---------+
//! ```
//!
//! The receiving side feeds chunks into a [`Reassembler`], which tolerates
//! reordering, duplicates, and interleaving of independent datagrams, and
//! suppresses replays of recently completed datagrams.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Chunk header size: packet_id (2) + total (1) + seq (1).
pub const FRAG_HEADER_LEN: usize = 4;

/// Default payload bytes per chunk. Sized so that a full chunk's base32
/// encoding plus the session and domain labels stays inside the 253-byte
/// QNAME limit for typical tunnel domains.
pub const MAX_CHUNK: usize = 124;

/// How long a completed packet id keeps suppressing duplicate chunks.
pub const DUP_WINDOW: Duration = Duration::from_secs(30);

/// Pending-map size past which partial reassembly state is flushed wholesale.
pub const PENDING_GC_CAP: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// The datagram would need more than 255 chunks.
    #[error("datagram of {0} bytes exceeds the {1}-chunk payload limit")]
    TooLarge(usize, usize),
}

/// Split a datagram into chunks of at most `max_chunk` payload bytes.
///
/// The packet id is chosen at random; chunks are emitted in `seq` order.
/// Datagrams larger than `255 * max_chunk` are not representable and are
/// rejected.
pub fn fragment_datagram(data: &[u8], max_chunk: usize) -> Result<Vec<Vec<u8>>, FragmentError> {
    let packet_id: u16 = rand::random();
    fragment_with_id(data, max_chunk, packet_id)
}

fn fragment_with_id(
    data: &[u8],
    max_chunk: usize,
    packet_id: u16,
) -> Result<Vec<Vec<u8>>, FragmentError> {
    let total = data.len().div_ceil(max_chunk).max(1);
    if total > 255 {
        return Err(FragmentError::TooLarge(data.len(), 255 * max_chunk));
    }

    let mut chunks = Vec::with_capacity(total);
    for seq in 0..total {
        let start = seq * max_chunk;
        let end = (start + max_chunk).min(data.len());

        let mut chunk = Vec::with_capacity(FRAG_HEADER_LEN + (end - start));
        chunk.extend_from_slice(&packet_id.to_be_bytes());
        chunk.push(total as u8);
        chunk.push(seq as u8);
        chunk.extend_from_slice(&data[start..end]);
        chunks.push(chunk);
    }

    Ok(chunks)
}

struct PendingPacket {
    chunks: Vec<Option<Vec<u8>>>,
    total: u8,
    received: u8,
    created_at: Instant,
}

/// Reassembles fragmented datagrams from chunks arriving in any order.
///
/// Not internally synchronized; callers wrap it in a mutex when shared.
pub struct Reassembler {
    pending: HashMap<u16, PendingPacket>,
    completed: HashMap<u16, Instant>,
    dup_window: Duration,
    pending_cap: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_limits(DUP_WINDOW, PENDING_GC_CAP)
    }

    /// Create a reassembler with a custom duplicate-suppression window and
    /// pending-map cap.
    pub fn with_limits(dup_window: Duration, pending_cap: usize) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            dup_window,
            pending_cap,
        }
    }

    /// Feed one chunk. Returns the full datagram once every chunk of its
    /// packet id has been seen, and `None` otherwise.
    ///
    /// Duplicate chunks are idempotent. Chunks for a packet id that finished
    /// reassembly within the duplicate window are dropped without creating
    /// new state.
    pub fn ingest(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < FRAG_HEADER_LEN {
            return None;
        }

        let packet_id = u16::from_be_bytes([data[0], data[1]]);
        let total = data[2];
        let seq = data[3];
        let payload = &data[FRAG_HEADER_LEN..];

        if total == 0 || seq >= total {
            return None;
        }

        // Expire old completed entries before the duplicate check, so a
        // replay after the window opens a fresh reassembly.
        let now = Instant::now();
        let dup_window = self.dup_window;
        self.completed
            .retain(|_, done_at| now.duration_since(*done_at) <= dup_window);

        if self.completed.contains_key(&packet_id) {
            return None;
        }

        if !self.pending.contains_key(&packet_id) && self.pending.len() > self.pending_cap {
            let oldest = self.pending.values().map(|p| p.created_at.elapsed()).max();
            log::debug!(
                "reassembler pending map over {} entries (oldest {:?}), flushing",
                self.pending_cap,
                oldest
            );
            self.pending.clear();
        }

        let entry = self.pending.entry(packet_id).or_insert_with(|| PendingPacket {
            chunks: vec![None; total as usize],
            total,
            received: 0,
            created_at: now,
        });

        // A different total for the same packet id means the sender reused
        // the id for a new datagram; the old partial state is discarded.
        if entry.total != total {
            log::debug!(
                "packet id {packet_id:#06x} reused with total {total} (was {}), restarting",
                entry.total
            );
            *entry = PendingPacket {
                chunks: vec![None; total as usize],
                total,
                received: 0,
                created_at: now,
            };
        }

        let slot = &mut entry.chunks[seq as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            entry.received += 1;
        }

        if entry.received == entry.total {
            let entry = self.pending.remove(&packet_id)?;
            self.completed.insert(packet_id, now);
            let mut full = Vec::new();
            for chunk in entry.chunks {
                full.extend_from_slice(&chunk?);
            }
            return Some(full);
        }

        None
    }

    /// Number of datagrams with partial state.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
