//! Dnsveil: a covert tunnel that carries QUIC across ordinary recursive
//! DNS traffic.
//!
//! Two peers cooperate. The **client** exposes a local SOCKS5 proxy and
//! speaks to a recursive resolver; the **server** answers as the
//! authoritative name server for one or more tunnel domains. Between them,
//! QUIC datagrams are fragmented, base32-encoded into query names on the
//! way up, and packed as base64 TXT answers on the way down. An unmodified
//! QUIC engine runs on both ends and never learns that its "UDP socket"
//! is a DNS conversation.
//!
//! ## Architecture
//!
//! ```text
//! app ──▶ SOCKS5 ──▶ QUIC ──▶ DnsPacketConn ──▶ recursor ─┐
//!                                                         ▼
//!                    target ◀── dialer ◀── QUIC ◀── VirtualConn ◀── DnsHandler
//! ```
//!
//! - [`fragment`]: chunking and reassembly of datagrams
//! - [`dns`]: DNS wire codec and the chunk/qname/TXT mapping
//! - [`client_conn`]: client-side DNS-as-UDP adapter with its poll engines
//! - [`server_conn`]: server-side virtual socket and session addressing
//! - [`handler`]: the server's DNS request loop
//! - [`session`]: session-keyed server state with TTL eviction
//! - [`tunnel`]: client connection lifecycle and reconnection
//! - [`keys`], [`socks`]: Ed25519 pinning and the SOCKS5 surfaces

pub mod client;
pub mod client_conn;
pub mod config;
pub mod dns;
pub mod fragment;
pub mod handler;
pub mod keys;
pub mod server;
pub mod server_conn;
pub mod session;
pub mod socks;
pub mod tunnel;

pub use client::{run_client, ClientArgs};
pub use client_conn::DnsPacketConn;
pub use config::{ServerOptions, TunnelOptions};
pub use fragment::{fragment_datagram, Reassembler};
pub use handler::DnsHandler;
pub use server::{run_server, ServerArgs};
pub use server_conn::VirtualConn;
pub use session::{SessionAddr, SessionManager};
pub use tunnel::TunnelManager;
