//! DNS wire format per RFC 1035.
//!
//! A DNS message is a fixed 12-byte header followed by variable question,
//! answer, authority, and additional sections. This module parses incoming
//! queries and encodes replies.
//!
//! # Header layout
//!
//! ```text
//! 0                   1
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    QDCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ANCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    NSCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ARCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```
//!
//! Only queries are parsed (this server never consumes foreign responses;
//! referrals are walked in-process). Name decompression follows pointer
//! chains with a hop bound so a malicious pointer loop cannot hang a
//! worker. Responses exceeding the UDP ceiling are truncated with TC set;
//! TCP fallback is a documented limitation, not implemented.

use crate::dns::record::{RecordData, RecordType, ResourceRecord};
use crate::error::{Error, Result};

/// Fixed header size in bytes.
pub const DNS_HEADER_SIZE: usize = 12;

/// Classic UDP payload ceiling; larger answers get TC set.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Internet class. The only class this server speaks.
pub const CLASS_IN: u16 = 1;

/// Maximum label length per RFC 1035 §2.3.4.
const MAX_LABEL_LEN: usize = 63;

/// Maximum encoded name length per RFC 1035 §2.3.4.
const MAX_NAME_LEN: usize = 255;

/// Compression pointer hops tolerated before declaring a loop.
const MAX_POINTER_HOPS: usize = 16;

/// Response codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
}

impl TryFrom<u8> for Rcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoError),
            1 => Ok(Self::FormErr),
            2 => Ok(Self::ServFail),
            3 => Ok(Self::NxDomain),
            other => Err(other),
        }
    }
}

/// Parsed DNS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: Rcode,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DNS_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "DNS header too short: {} bytes (minimum {})",
                data.len(),
                DNS_HEADER_SIZE
            )));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let rcode = Rcode::try_from((flags & 0x000f) as u8)
            .map_err(|code| Error::InvalidPacket(format!("Unsupported RCODE {}", code)))?;

        Ok(Self {
            id,
            is_response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0f) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode,
            question_count: u16::from_be_bytes([data[4], data[5]]),
            answer_count: u16::from_be_bytes([data[6], data[7]]),
            authority_count: u16::from_be_bytes([data[8], data[9]]),
            additional_count: u16::from_be_bytes([data[10], data[11]]),
        })
    }

    pub fn encode(&self) -> [u8; DNS_HEADER_SIZE] {
        let mut flags = 0u16;
        if self.is_response {
            flags |= 0x8000;
        }
        flags |= u16::from(self.opcode & 0x0f) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags |= u16::from(self.rcode as u8);

        let mut out = [0u8; DNS_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.id.to_be_bytes());
        out[2..4].copy_from_slice(&flags.to_be_bytes());
        out[4..6].copy_from_slice(&self.question_count.to_be_bytes());
        out[6..8].copy_from_slice(&self.answer_count.to_be_bytes());
        out[8..10].copy_from_slice(&self.authority_count.to_be_bytes());
        out[10..12].copy_from_slice(&self.additional_count.to_be_bytes());
        out
    }
}

/// A question section entry.
///
/// `qtype` is kept raw so unknown types can be answered with a clean
/// negative rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// The typed record type, if this server supports it.
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::try_from(self.qtype).ok()
    }
}

/// A parsed DNS query: header plus question section.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub header: Header,
    pub questions: Vec<Question>,
}

impl DnsQuery {
    /// Parses a query message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] on a short header, truncated
    /// question section, oversized names, or compression-pointer loops.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        if header.is_response {
            return Err(Error::InvalidPacket(
                "Expected a query, got a response".to_string(),
            ));
        }

        let mut questions = Vec::with_capacity(usize::from(header.question_count));
        let mut offset = DNS_HEADER_SIZE;
        for _ in 0..header.question_count {
            let (name, after_name) = decode_name(data, offset)?;
            if after_name + 4 > data.len() {
                return Err(Error::InvalidPacket(
                    "Question section truncated".to_string(),
                ));
            }
            let qtype = u16::from_be_bytes([data[after_name], data[after_name + 1]]);
            let qclass = u16::from_be_bytes([data[after_name + 2], data[after_name + 3]]);
            questions.push(Question { name, qtype, qclass });
            offset = after_name + 4;
        }

        Ok(Self { header, questions })
    }
}

/// A DNS response under construction.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
}

impl DnsResponse {
    /// Builds a reply skeleton echoing `query`'s id, opcode, RD flag, and
    /// question section.
    pub fn for_query(query: &DnsQuery, rcode: Rcode, authoritative: bool) -> Self {
        Self {
            header: Header {
                id: query.header.id,
                is_response: true,
                opcode: query.header.opcode,
                authoritative,
                truncated: false,
                recursion_desired: query.header.recursion_desired,
                recursion_available: true,
                rcode,
                question_count: query.questions.len() as u16,
                answer_count: 0,
                authority_count: 0,
                additional_count: 0,
            },
            questions: query.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
        }
    }

    /// A FORMERR reply carrying only the echoed id.
    pub fn format_error(id: u16) -> Self {
        Self {
            header: Header {
                id,
                is_response: true,
                opcode: 0,
                authoritative: false,
                truncated: false,
                recursion_desired: false,
                recursion_available: true,
                rcode: Rcode::FormErr,
                question_count: 0,
                answer_count: 0,
                authority_count: 0,
                additional_count: 0,
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
        }
    }

    /// Encodes the response, truncating to the UDP ceiling if needed.
    ///
    /// When the full message exceeds [`MAX_UDP_PAYLOAD`], the answer and
    /// authority sections are dropped and TC is set so the client knows
    /// the reply is incomplete.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let full = self.encode_sections(false)?;
        if full.len() <= MAX_UDP_PAYLOAD {
            return Ok(full);
        }
        self.encode_sections(true)
    }

    fn encode_sections(&self, truncate: bool) -> Result<Vec<u8>> {
        let mut header = self.header;
        if truncate {
            header.truncated = true;
            header.answer_count = 0;
            header.authority_count = 0;
        } else {
            header.answer_count = self.answers.len() as u16;
            header.authority_count = self.authorities.len() as u16;
        }
        header.question_count = self.questions.len() as u16;

        let mut out = Vec::with_capacity(MAX_UDP_PAYLOAD);
        out.extend_from_slice(&header.encode());

        for question in &self.questions {
            encode_name(&question.name, &mut out)?;
            out.extend_from_slice(&question.qtype.to_be_bytes());
            out.extend_from_slice(&question.qclass.to_be_bytes());
        }

        if !truncate {
            for record in self.answers.iter().chain(self.authorities.iter()) {
                encode_record(record, &mut out)?;
            }
        }

        Ok(out)
    }
}

/// Encodes a domain name as a sequence of length-prefixed labels.
///
/// Compression is not emitted; every name is written in full.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let name = name.trim_end_matches('.');
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidPacket(format!(
            "Name too long: {} bytes",
            name.len()
        )));
    }

    if !name.is_empty() {
        for label in name.split('.') {
            let bytes = label.as_bytes();
            if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
                return Err(Error::InvalidPacket(format!(
                    "Invalid label length {} in {}",
                    bytes.len(),
                    name
                )));
            }
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
    }
    out.push(0);
    Ok(())
}

/// Decodes a possibly-compressed domain name starting at `offset`.
///
/// Returns the name and the offset just past its encoding in the
/// original stream (pointers do not advance the outer cursor beyond the
/// two pointer bytes).
pub fn decode_name(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut position = offset;
    let mut after_pointer: Option<usize> = None;
    let mut hops = 0usize;
    let mut total_len = 0usize;

    loop {
        let length = *data
            .get(position)
            .ok_or_else(|| Error::InvalidPacket("Name runs past end of packet".to_string()))?
            as usize;

        if length & 0xc0 == 0xc0 {
            let low = *data.get(position + 1).ok_or_else(|| {
                Error::InvalidPacket("Compression pointer truncated".to_string())
            })? as usize;
            let target = ((length & 0x3f) << 8) | low;

            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(Error::InvalidPacket(
                    "Compression pointer loop".to_string(),
                ));
            }
            if after_pointer.is_none() {
                after_pointer = Some(position + 2);
            }
            if target >= position {
                // Forward pointers are never produced by conforming
                // encoders and enable loops.
                return Err(Error::InvalidPacket(
                    "Forward compression pointer".to_string(),
                ));
            }
            position = target;
            continue;
        }

        if length == 0 {
            position += 1;
            break;
        }

        if length > MAX_LABEL_LEN {
            return Err(Error::InvalidPacket(format!(
                "Label length {} exceeds maximum {}",
                length, MAX_LABEL_LEN
            )));
        }

        let start = position + 1;
        let end = start + length;
        if end > data.len() {
            return Err(Error::InvalidPacket("Label truncated".to_string()));
        }

        total_len += length + 1;
        if total_len > MAX_NAME_LEN {
            return Err(Error::InvalidPacket("Name exceeds 255 bytes".to_string()));
        }

        labels.push(String::from_utf8_lossy(&data[start..end]).to_ascii_lowercase());
        position = end;
    }

    let consumed_until = after_pointer.unwrap_or(position);
    Ok((labels.join("."), consumed_until))
}

fn encode_record(record: &ResourceRecord, out: &mut Vec<u8>) -> Result<()> {
    encode_name(&record.name, out)?;
    out.extend_from_slice(&record.record_type().code().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&record.ttl_seconds.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Aaaa(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Cname(target) | RecordData::Ns(target) | RecordData::Ptr(target) => {
            encode_name(target, &mut rdata)?;
        }
        RecordData::Mx {
            preference,
            exchange,
        } => {
            rdata.extend_from_slice(&preference.to_be_bytes());
            encode_name(exchange, &mut rdata)?;
        }
        RecordData::Txt(text) => {
            let bytes = text.as_bytes();
            let len = bytes.len().min(255);
            rdata.push(len as u8);
            rdata.extend_from_slice(&bytes[..len]);
        }
        RecordData::Soa(soa) => {
            encode_name(&soa.primary_ns, &mut rdata)?;
            encode_name(&soa.responsible, &mut rdata)?;
            rdata.extend_from_slice(&soa.serial.to_be_bytes());
            rdata.extend_from_slice(&soa.refresh.to_be_bytes());
            rdata.extend_from_slice(&soa.retry.to_be_bytes());
            rdata.extend_from_slice(&soa.expire.to_be_bytes());
            rdata.extend_from_slice(&soa.minimum_ttl.to_be_bytes());
        }
    }

    if rdata.len() > usize::from(u16::MAX) {
        return Err(Error::InvalidPacket("RDATA too large".to_string()));
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&0x0100u16.to_be_bytes()); // RD set
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 6]);
        encode_name(name, &mut data).unwrap();
        data.extend_from_slice(&qtype.to_be_bytes());
        data.extend_from_slice(&CLASS_IN.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_query() {
        let data = build_query(0x1234, "example.test", RecordType::A.code());
        let query = DnsQuery::parse(&data).unwrap();

        assert_eq!(query.header.id, 0x1234);
        assert!(!query.header.is_response);
        assert!(query.header.recursion_desired);
        assert_eq!(query.questions.len(), 1);
        assert_eq!(query.questions[0].name, "example.test");
        assert_eq!(query.questions[0].record_type(), Some(RecordType::A));
    }

    #[test]
    fn test_header_flags_roundtrip() {
        let header = Header {
            id: 0xbeef,
            is_response: true,
            opcode: 0,
            authoritative: true,
            truncated: false,
            recursion_desired: true,
            recursion_available: true,
            rcode: Rcode::NxDomain,
            question_count: 1,
            answer_count: 0,
            authority_count: 1,
            additional_count: 0,
        };

        let parsed = Header::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(Header::parse(&[0u8; 11]).is_err());
        assert!(DnsQuery::parse(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_truncated_question_rejected() {
        let mut data = build_query(1, "example.test", RecordType::A.code());
        data.truncate(data.len() - 3);
        assert!(DnsQuery::parse(&data).is_err());
    }

    #[test]
    fn test_response_packet_rejected_as_query() {
        let mut data = build_query(1, "example.test", RecordType::A.code());
        data[2] |= 0x80; // QR bit
        assert!(DnsQuery::parse(&data).is_err());
    }

    #[test]
    fn test_name_roundtrip() {
        let mut buf = Vec::new();
        encode_name("www.Example.Test", &mut buf).unwrap();
        let (name, consumed) = decode_name(&buf, 0).unwrap();
        assert_eq!(name, "www.example.test");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_root_name() {
        let mut buf = Vec::new();
        encode_name("", &mut buf).unwrap();
        assert_eq!(buf, vec![0]);
        let (name, consumed) = decode_name(&buf, 0).unwrap();
        assert_eq!(name, "");
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_compressed_name() {
        // "example.test" at offset 0, then "www" + pointer to it.
        let mut data = Vec::new();
        encode_name("example.test", &mut data).unwrap();
        let pointer_site = data.len();
        data.push(3);
        data.extend_from_slice(b"www");
        data.push(0xc0);
        data.push(0);

        let (name, consumed) = decode_name(&data, pointer_site).unwrap();
        assert_eq!(name, "www.example.test");
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // Pointer at offset 2 targeting offset 0, which points at itself.
        let data = vec![0xc0, 0x00, 0xc0, 0x00];
        assert!(decode_name(&data, 2).is_err());
    }

    #[test]
    fn test_forward_pointer_rejected() {
        let data = vec![0xc0, 0x02, 0x00];
        assert!(decode_name(&data, 0).is_err());
    }

    #[test]
    fn test_oversized_label_rejected() {
        let long_label = "a".repeat(64);
        let mut buf = Vec::new();
        assert!(encode_name(&long_label, &mut buf).is_err());
    }

    #[test]
    fn test_response_encoding_offsets() {
        let data = build_query(0x4242, "example.test", RecordType::A.code());
        let query = DnsQuery::parse(&data).unwrap();

        let mut response = DnsResponse::for_query(&query, Rcode::NoError, true);
        response.answers.push(ResourceRecord::new(
            "example.test",
            300,
            RecordData::A(Ipv4Addr::new(93, 184, 216, 34)),
        ));

        let encoded = response.encode().unwrap();
        let header = Header::parse(&encoded).unwrap();
        assert_eq!(header.id, 0x4242);
        assert!(header.is_response);
        assert!(header.authoritative);
        assert_eq!(header.question_count, 1);
        assert_eq!(header.answer_count, 1);

        // Answer RR sits right after the echoed question.
        let question_end = DNS_HEADER_SIZE + "example.test".len() + 2 + 4;
        let (owner, after_name) = decode_name(&encoded, question_end).unwrap();
        assert_eq!(owner, "example.test");
        let rtype = u16::from_be_bytes([encoded[after_name], encoded[after_name + 1]]);
        assert_eq!(rtype, RecordType::A.code());
        let ttl = u32::from_be_bytes([
            encoded[after_name + 4],
            encoded[after_name + 5],
            encoded[after_name + 6],
            encoded[after_name + 7],
        ]);
        assert_eq!(ttl, 300);
        assert_eq!(&encoded[after_name + 10..after_name + 14], &[93, 184, 216, 34]);
    }

    #[test]
    fn test_oversized_response_truncated() {
        let data = build_query(7, "big.example.test", RecordType::Txt.code());
        let query = DnsQuery::parse(&data).unwrap();

        let mut response = DnsResponse::for_query(&query, Rcode::NoError, true);
        for _ in 0..8 {
            response.answers.push(ResourceRecord::new(
                "big.example.test",
                60,
                RecordData::Txt("x".repeat(200)),
            ));
        }

        let encoded = response.encode().unwrap();
        assert!(encoded.len() <= MAX_UDP_PAYLOAD);
        let header = Header::parse(&encoded).unwrap();
        assert!(header.truncated);
        assert_eq!(header.answer_count, 0);
    }

    #[test]
    fn test_format_error_reply() {
        let reply = DnsResponse::format_error(0x9999);
        let encoded = reply.encode().unwrap();
        let header = Header::parse(&encoded).unwrap();
        assert_eq!(header.id, 0x9999);
        assert_eq!(header.rcode, Rcode::FormErr);
        assert_eq!(encoded.len(), DNS_HEADER_SIZE);
    }
}
