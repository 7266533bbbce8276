// Minimal DNS protocol implementation for the tunnel transport.
//
// Implements just enough of the DNS protocol to:
// - Build TXT queries with an EDNS0 OPT record
// - Build responses carrying multiple TXT answers
// - Parse queries and responses, tolerating compression pointers

use super::{DnsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// TXT record type code.
pub const TYPE_TXT: u16 = 16;
/// OPT pseudo-record type code (EDNS0).
pub const TYPE_OPT: u16 = 41;
/// IN class code.
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

/// DNS response codes used by the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Rcode {
    NoError = 0,
    Refused = 5,
}

/// DNS message header (12 bytes).
#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// Header for a standard query with recursion desired.
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Header for a reply mirroring `query`, with QR and RA set.
    pub fn new_reply(query: &DnsHeader, ancount: u16, rcode: Rcode) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | (query.flags & FLAG_RD) | FLAG_RA | rcode as u16,
            qdcount: query.qdcount,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(DnsError::InvalidMessage("header too short".into()));
        }
        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }
}

/// DNS question.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    /// Dotted name without the trailing root dot, original case preserved.
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new_txt(qname: &str) -> Self {
        Self {
            qname: qname.trim_end_matches('.').to_string(),
            qtype: TYPE_TXT,
            qclass: CLASS_IN,
        }
    }

    fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_name(buf)?;
        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("question too short".into()));
        }
        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_name(&self.qname, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }
}

/// DNS resource record. Only TXT and OPT are ever built; anything parses.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// TXT record whose rdata is `data` split into length-prefixed
    /// character-strings of at most 255 bytes.
    pub fn new_txt(name: &str, data: &[u8], ttl: u32) -> Self {
        let mut rdata = Vec::with_capacity(data.len() + data.len() / 255 + 1);
        if data.is_empty() {
            rdata.push(0);
        }
        for part in data.chunks(255) {
            rdata.push(part.len() as u8);
            rdata.extend_from_slice(part);
        }
        Self {
            name: name.trim_end_matches('.').to_string(),
            rtype: TYPE_TXT,
            rclass: CLASS_IN,
            ttl,
            rdata,
        }
    }

    fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(buf)?;
        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("record too short".into()));
        }
        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;
        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("truncated record data".into()));
        }
        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);
        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    /// Rejoin the character-strings of a TXT record with no separator.
    /// Recursors split logical strings longer than 255 bytes.
    pub fn txt_data(&self) -> Result<Vec<u8>> {
        if self.rtype != TYPE_TXT {
            return Err(DnsError::DecodingError("not a TXT record".into()));
        }
        let mut out = Vec::with_capacity(self.rdata.len());
        let mut cursor = Cursor::new(&self.rdata[..]);
        while cursor.has_remaining() {
            let len = cursor.get_u8() as usize;
            if cursor.remaining() < len {
                return Err(DnsError::DecodingError("truncated TXT string".into()));
            }
            let start = cursor.position() as usize;
            out.extend_from_slice(&self.rdata[start..start + len]);
            cursor.advance(len);
        }
        Ok(out)
    }
}

/// Complete DNS message (query or response).
#[derive(Debug)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    /// TXT query with an EDNS0 OPT advertising a large UDP payload.
    pub fn new_query(qname: &str, id: u16) -> Self {
        Self {
            header: DnsHeader::new_query(id),
            questions: vec![DnsQuestion::new_txt(qname)],
            answers: Vec::new(),
        }
    }

    /// Reply to `query` carrying `answers` TXT records.
    pub fn new_reply(query: &DnsMessage, answers: Vec<DnsRecord>, rcode: Rcode) -> Self {
        Self {
            header: DnsHeader::new_reply(&query.header, answers.len() as u16, rcode),
            questions: query.questions.clone(),
            answers,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(&mut cursor)?);
        }

        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(&mut cursor)?);
        }

        // Authority and additional records (including the OPT) are parsed
        // only to keep the cursor consistent, then discarded.
        for _ in 0..header.nscount.saturating_add(header.arcount) {
            if !cursor.has_remaining() {
                break;
            }
            DnsRecord::parse(&mut cursor)?;
        }

        Ok(Self {
            header,
            questions,
            answers,
        })
    }

    /// Serialize. Queries get an OPT record appended; answers use a
    /// compression pointer back to the question name.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(512);
        let mut header = self.header.clone();
        if !header.is_response() {
            header.arcount = 1;
        }
        header.write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf)?;
        }

        for a in &self.answers {
            // All answers mirror the (first) question name, which starts at
            // offset 12, right after the header.
            buf.put_u16(0xC000 | 12);
            buf.put_u16(a.rtype);
            buf.put_u16(a.rclass);
            buf.put_u32(a.ttl);
            buf.put_u16(a.rdata.len() as u16);
            buf.put_slice(&a.rdata);
        }

        if !header.is_response() {
            write_opt(&mut buf);
        }

        Ok(buf.to_vec())
    }

    pub fn question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }
}

/// EDNS0 OPT pseudo-record: root name, type OPT, requestor payload size in
/// the class field, zeroed extended flags, empty rdata.
fn write_opt(buf: &mut BytesMut) {
    buf.put_u8(0);
    buf.put_u16(TYPE_OPT);
    buf.put_u16(super::EDNS_UDP_PAYLOAD);
    buf.put_u32(0);
    buf.put_u16(0);
}

fn write_name(name: &str, buf: &mut BytesMut) -> Result<()> {
    let name = name.trim_end_matches('.');
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > super::MAX_DNS_LABEL_LEN {
                return Err(DnsError::EncodingError(format!(
                    "invalid label length {} in {:?}",
                    label.len(),
                    name
                )));
            }
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
    }
    buf.put_u8(0);
    Ok(())
}

/// Read a (possibly compressed) domain name, leaving the cursor after the
/// name's in-place representation.
fn read_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut jumped = false;
    let mut resume = 0u64;
    // A name has at most 127 labels; anything beyond that is a pointer loop.
    let mut guard = 128;

    loop {
        guard -= 1;
        if guard == 0 {
            return Err(DnsError::InvalidMessage("name pointer loop".into()));
        }
        if !buf.has_remaining() {
            return Err(DnsError::InvalidMessage("truncated name".into()));
        }
        let len = buf.get_u8();
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            if !buf.has_remaining() {
                return Err(DnsError::InvalidMessage("truncated name pointer".into()));
            }
            let offset = u16::from_be_bytes([len & 0x3F, buf.get_u8()]) as u64;
            if !jumped {
                resume = buf.position();
                jumped = true;
            }
            if offset >= buf.get_ref().len() as u64 {
                return Err(DnsError::InvalidMessage("name pointer out of range".into()));
            }
            buf.set_position(offset);
            continue;
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(DnsError::InvalidMessage("truncated label".into()));
        }
        let start = buf.position() as usize;
        let bytes = &buf.get_ref()[start..start + len];
        let label = std::str::from_utf8(bytes)
            .map_err(|_| DnsError::InvalidMessage("non-UTF8 label".into()))?;
        labels.push(label.to_string());
        buf.advance(len);
    }

    if jumped {
        buf.set_position(resume);
    }
    Ok(labels.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let msg = DnsMessage::new_query("data.sess.n.example.com", 0x1234);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);

        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert!(!parsed.header.is_response());
        assert_eq!(parsed.header.qdcount, 1);
        // The OPT in the additional section is consumed but not exposed.
        assert_eq!(parsed.question().unwrap().qname, "data.sess.n.example.com");
        assert_eq!(parsed.question().unwrap().qtype, TYPE_TXT);
    }

    #[test]
    fn reply_roundtrip_with_answers() {
        let query = DnsMessage::new_query("abc.sess.n.example.com", 7);
        let answers = vec![
            DnsRecord::new_txt("abc.sess.n.example.com", b"first", 0),
            DnsRecord::new_txt("abc.sess.n.example.com", b"second", 0),
        ];
        let reply = DnsMessage::new_reply(&query, answers, Rcode::NoError);
        let bytes = reply.to_bytes().unwrap();

        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.rcode(), 0);
        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.answers[0].txt_data().unwrap(), b"first");
        assert_eq!(parsed.answers[1].txt_data().unwrap(), b"second");
        // Compressed answer names resolve back to the question name.
        assert_eq!(parsed.answers[1].name, "abc.sess.n.example.com");
    }

    #[test]
    fn refused_reply_has_rcode() {
        let query = DnsMessage::new_query("x.other.example.net", 9);
        let reply = DnsMessage::new_reply(&query, Vec::new(), Rcode::Refused);
        let parsed = DnsMessage::parse(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.header.rcode(), 5);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn txt_strings_longer_than_255_are_split_and_rejoined() {
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let rec = DnsRecord::new_txt("a.example.com", &data, 0);
        // 600 bytes -> 3 character-strings.
        assert_eq!(rec.rdata.len(), 600 + 3);
        assert_eq!(rec.txt_data().unwrap(), data);
    }

    #[test]
    fn name_at_253_octets_parses() {
        // 4 labels of 57 + session + domain, exactly at the limit.
        let label = "A".repeat(57);
        let qname = format!("{l}.{l}.{l}.{l}.abcd1234.tunnel.abcde", l = label);
        assert_eq!(qname.len(), 253);
        let msg = DnsMessage::new_query(&qname, 1);
        let parsed = DnsMessage::parse(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.question().unwrap().qname, qname);
    }

    #[test]
    fn malformed_messages_error() {
        assert!(DnsMessage::parse(&[0u8; 5]).is_err());
        // Claims one question but has none.
        let bytes = [0u8, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        assert!(DnsMessage::parse(&bytes).is_err());
    }

    #[test]
    fn oversized_label_rejected_on_write() {
        let qname = format!("{}.example.com", "A".repeat(64));
        assert!(DnsMessage::new_query(&qname, 1).to_bytes().is_err());
    }
}
