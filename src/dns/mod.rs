// DNS wire layer for the tunnel.
//
// message: minimal DNS message build/parse (header, question, TXT, OPT)
// codec:   mapping between chunks and queries/responses (base32 qnames,
//          base64 TXT strings, poll markers)

pub mod codec;
pub mod message;

pub use codec::{
    decode_query_payload, decode_txt_payloads, encode_data_query, encode_poll_query, encode_refused,
    encode_reply, max_chunk_for_domain, QueryPayload,
};
pub use message::{DnsHeader, DnsMessage, DnsQuestion, DnsRecord, Rcode};

/// Maximum DNS name length in presentation form (RFC 1035).
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Maximum single label length (RFC 1035).
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Label size used for encoded data. Below the 63-char hard limit to leave
/// margin for recursors that rewrite names.
pub const LABEL_CHUNK_LEN: usize = 57;

/// UDP payload size advertised in the EDNS0 OPT record on every query.
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

/// First label of a downstream-only query.
pub const POLL_KEYWORD: &str = "poll";

pub type Result<T> = std::result::Result<T, DnsError>;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("payload of {0} bytes does not fit a query for this domain (max {1})")]
    PayloadTooLarge(usize, usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
