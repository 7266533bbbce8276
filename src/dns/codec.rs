//! Mapping between tunnel chunks and DNS wire messages.
//!
//! Upstream, a chunk is base32-encoded (RFC 4648, uppercase, no padding so
//! no `=` lands in a label), split into short labels, and prefixed to
//! `<session>.<domain>`. Downstream, each chunk travels as one base64
//! TXT string. Poll queries carry no data; their random nonce label busts
//! recursor caches, without which the resolver keeps replaying stale TXT
//! answers and downstream throughput collapses.

use super::message::{DnsMessage, DnsRecord, Rcode};
use super::{DnsError, Result, LABEL_CHUNK_LEN, MAX_DNS_NAME_LEN, POLL_KEYWORD};
use base32::Alphabet;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const B32: Alphabet = Alphabet::RFC4648 { padding: false };

/// What an inbound query's name carried once the domain and session labels
/// are stripped.
#[derive(Debug, PartialEq, Eq)]
pub enum QueryPayload {
    /// Downstream-only request; nothing to ingest.
    Poll,
    /// A decoded chunk.
    Chunk(Vec<u8>),
}

/// Build the DNS query carrying `chunk` for `session` under `domain`.
pub fn encode_data_query(chunk: &[u8], session: &str, domain: &str) -> Result<Vec<u8>> {
    let encoded = base32::encode(B32, chunk);
    let mut qname = String::with_capacity(encoded.len() + encoded.len() / LABEL_CHUNK_LEN + 1);
    for (i, piece) in encoded.as_bytes().chunks(LABEL_CHUNK_LEN).enumerate() {
        if i > 0 {
            qname.push('.');
        }
        // chunks() of an ASCII string yields valid UTF-8.
        qname.push_str(std::str::from_utf8(piece).expect("base32 output is ASCII"));
    }
    qname.push('.');
    qname.push_str(session);
    qname.push('.');
    qname.push_str(domain.trim_end_matches('.'));

    if qname.len() > MAX_DNS_NAME_LEN {
        return Err(DnsError::PayloadTooLarge(
            chunk.len(),
            max_chunk_for_domain(domain),
        ));
    }

    DnsMessage::new_query(&qname, rand::random()).to_bytes()
}

/// Build a poll query: `poll.<nonce>.<session>.<domain>`.
pub fn encode_poll_query(session: &str, domain: &str) -> Result<Vec<u8>> {
    let nonce: [u8; 4] = rand::random();
    let qname = format!(
        "{POLL_KEYWORD}.{}.{session}.{}",
        base32::encode(B32, &nonce),
        domain.trim_end_matches('.')
    );
    DnsMessage::new_query(&qname, rand::random()).to_bytes()
}

/// Split an inbound data prefix (labels already joined without separator)
/// into its payload. Case-insensitive `poll` prefix marks a poll; anything
/// else must be base32.
pub fn decode_query_payload(data_prefix: &str) -> Result<QueryPayload> {
    let bytes = data_prefix.as_bytes();
    if bytes.len() >= POLL_KEYWORD.len()
        && bytes[..POLL_KEYWORD.len()].eq_ignore_ascii_case(POLL_KEYWORD.as_bytes())
    {
        return Ok(QueryPayload::Poll);
    }
    // Recursors lowercase names in flight; standard base32 wants uppercase.
    let normalized = data_prefix.to_ascii_uppercase();
    let raw = base32::decode(B32, &normalized)
        .ok_or_else(|| DnsError::DecodingError(format!("bad base32 ({} chars)", normalized.len())))?;
    Ok(QueryPayload::Chunk(raw))
}

/// One base64 TXT answer per chunk, on the query's own name with TTL 0.
pub fn encode_reply(query: &DnsMessage, chunks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let qname = query
        .question()
        .ok_or_else(|| DnsError::InvalidMessage("reply to question-less query".into()))?
        .qname
        .clone();
    let answers = chunks
        .iter()
        .map(|c| DnsRecord::new_txt(&qname, BASE64.encode(c).as_bytes(), 0))
        .collect();
    DnsMessage::new_reply(query, answers, Rcode::NoError).to_bytes()
}

/// Empty REFUSED reply for names outside the registered domains.
pub fn encode_refused(query: &DnsMessage) -> Result<Vec<u8>> {
    DnsMessage::new_reply(query, Vec::new(), Rcode::Refused).to_bytes()
}

/// Extract and base64-decode every TXT answer of a response. Undecodable
/// records are skipped; each one stands alone.
pub fn decode_txt_payloads(msg: &DnsMessage) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(msg.answers.len());
    for rr in &msg.answers {
        let joined = match rr.txt_data() {
            Ok(j) => j,
            Err(err) => {
                log::debug!("skipping malformed TXT record: {err}");
                continue;
            }
        };
        match BASE64.decode(&joined) {
            Ok(raw) => out.push(raw),
            Err(err) => {
                log::debug!("failed to decode base64 TXT ({} chars): {err}", joined.len());
            }
        }
    }
    out
}

/// Largest chunk (header included) whose query name fits `domain`.
///
/// Works backwards from the 253-byte name limit: domain labels, the 8-char
/// session label, separator dots, then base32 expansion (8 chars per 5
/// bytes) and one dot per 57 encoded chars.
pub fn max_chunk_for_domain(domain: &str) -> usize {
    let domain = domain.trim_end_matches('.');
    let fixed = domain.len() + 1 + crate::session::SESSION_ID_LEN + 1;
    let Some(budget) = MAX_DNS_NAME_LEN.checked_sub(fixed) else {
        return 0;
    };

    // Longest base32 string that fits `budget` once dots are inserted.
    let mut best_encoded = 0;
    for len in 1..=budget {
        let dots = (len - 1) / LABEL_CHUNK_LEN;
        if len + dots <= budget {
            best_encoded = len;
        }
    }
    best_encoded * 5 / 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FRAG_HEADER_LEN;

    #[test]
    fn data_query_qname_layout() {
        // Spec scenario: 5-byte datagram as a single chunk.
        let chunk = [0x12, 0x34, 0x01, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05];
        let packet = encode_data_query(&chunk, "abcd1234", "n.example.com").unwrap();
        let msg = DnsMessage::parse(&packet).unwrap();
        let qname = &msg.question().unwrap().qname;

        let expected = base32::encode(B32, &chunk);
        assert_eq!(*qname, format!("{expected}.abcd1234.n.example.com"));
        assert_eq!(msg.question().unwrap().qtype, super::super::message::TYPE_TXT);
    }

    #[test]
    fn long_chunk_spans_labels() {
        let chunk = vec![0xABu8; 124 + FRAG_HEADER_LEN];
        let packet = encode_data_query(&chunk, "abcd1234", "t.io").unwrap();
        let msg = DnsMessage::parse(&packet).unwrap();
        let qname = &msg.question().unwrap().qname;

        let labels: Vec<&str> = qname.split('.').collect();
        // data labels + session + 2 domain labels
        assert!(labels.len() > 4);
        for l in &labels[..labels.len() - 3] {
            assert!(l.len() <= LABEL_CHUNK_LEN);
        }
        let joined: String = labels[..labels.len() - 3].concat();
        assert_eq!(
            base32::decode(B32, &joined).unwrap(),
            chunk
        );
    }

    #[test]
    fn oversized_chunk_rejected() {
        let domain = "a-rather-long-tunnel-domain.example.com";
        let max = max_chunk_for_domain(domain);
        assert!(encode_data_query(&vec![0u8; max], "abcd1234", domain).is_ok());
        assert!(encode_data_query(&vec![0u8; max + 1], "abcd1234", domain).is_err());
    }

    #[test]
    fn default_chunk_fits_typical_domain() {
        // MAX_CHUNK payload + header must fit a short tunnel domain.
        assert!(max_chunk_for_domain("n.example.com") >= crate::fragment::MAX_CHUNK + FRAG_HEADER_LEN);
    }

    #[test]
    fn poll_query_shape() {
        let packet = encode_poll_query("abcd1234", "n.example.com").unwrap();
        let msg = DnsMessage::parse(&packet).unwrap();
        let labels: Vec<String> = msg
            .question()
            .unwrap()
            .qname
            .split('.')
            .map(String::from)
            .collect();
        assert_eq!(labels[0], "poll");
        // 4 nonce bytes -> 7 base32 chars.
        assert_eq!(labels[1].len(), 7);
        assert_eq!(labels[2], "abcd1234");
        assert_eq!(&labels[3..], ["n", "example", "com"]);
    }

    #[test]
    fn poll_nonces_differ() {
        let a = DnsMessage::parse(&encode_poll_query("s", "d.io").unwrap()).unwrap();
        let b = DnsMessage::parse(&encode_poll_query("s", "d.io").unwrap()).unwrap();
        assert_ne!(a.question().unwrap().qname, b.question().unwrap().qname);
    }

    #[test]
    fn payload_classification() {
        assert_eq!(decode_query_payload("pollABCDEFG").unwrap(), QueryPayload::Poll);
        assert_eq!(decode_query_payload("POLLxyz").unwrap(), QueryPayload::Poll);

        let encoded = base32::encode(B32, b"\x00\x01\x01\x00hello");
        match decode_query_payload(&encoded).unwrap() {
            QueryPayload::Chunk(raw) => assert_eq!(raw, b"\x00\x01\x01\x00hello"),
            other => panic!("unexpected payload {other:?}"),
        }

        // Lowercased by a recursor on the way in.
        match decode_query_payload(&encoded.to_ascii_lowercase()).unwrap() {
            QueryPayload::Chunk(raw) => assert_eq!(raw, b"\x00\x01\x01\x00hello"),
            other => panic!("unexpected payload {other:?}"),
        }

        assert!(decode_query_payload("1nvalid!base32").is_err());
    }

    #[test]
    fn reply_packs_chunks_as_base64_txt() {
        let query = DnsMessage::parse(&encode_poll_query("abcd1234", "n.example.com").unwrap()).unwrap();
        let chunks = vec![vec![1u8, 2, 3], vec![4u8; 140]];
        let reply = DnsMessage::parse(&encode_reply(&query, &chunks).unwrap()).unwrap();

        assert!(reply.header.is_response());
        assert_eq!(reply.header.rcode(), 0);
        let decoded = decode_txt_payloads(&reply);
        assert_eq!(decoded, chunks);
    }

    #[test]
    fn empty_reply_is_noerror() {
        let query = DnsMessage::parse(&encode_poll_query("abcd1234", "n.example.com").unwrap()).unwrap();
        let reply = DnsMessage::parse(&encode_reply(&query, &[]).unwrap()).unwrap();
        assert_eq!(reply.header.rcode(), 0);
        assert!(reply.answers.is_empty());
        assert!(decode_txt_payloads(&reply).is_empty());
    }

    #[test]
    fn base32_base64_roundtrip_arbitrary_bytes() {
        let data: Vec<u8> = (0..=255).collect();
        let b32 = base32::encode(B32, &data);
        assert!(!b32.contains('='));
        assert_eq!(base32::decode(B32, &b32).unwrap(), data);

        let b64 = BASE64.encode(&data);
        assert_eq!(BASE64.decode(&b64).unwrap(), data);
    }
}
