//! UDP front end for the resolver.
//!
//! Listens on port 53 and spawns a task per datagram. Queries whose
//! header parses but whose body does not get a FORMERR reply; datagrams
//! too mangled to even carry a transaction id are dropped without a
//! response.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dns::resolver::{Resolution, Resolver};
use crate::dns::wire::{DnsQuery, DnsResponse, Header, Rcode, CLASS_IN};
use crate::error::Result;

/// Standard DNS server port.
pub const DNS_PORT: u16 = 53;

const CACHE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// The DNS server task.
pub struct DnsServer {
    resolver: Arc<Resolver>,
    bind_ip: Ipv4Addr,
    port: u16,
}

impl DnsServer {
    pub fn new(resolver: Arc<Resolver>, bind_ip: Ipv4Addr, port: u16) -> Self {
        Self {
            resolver,
            bind_ip,
            port,
        }
    }

    /// Binds the socket and serves queries until the task is aborted.
    pub async fn run(self) -> Result<()> {
        let bind_addr = SocketAddr::from((self.bind_ip, self.port));
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("DNS server listening on {}", bind_addr);
        self.serve(socket).await
    }

    /// Serves queries on an already-bound socket.
    pub async fn serve(self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let resolver = self.resolver;

        // Expired entries are dropped lazily on lookup; the sweep keeps
        // entries nobody asks about again from accumulating.
        let cache = Arc::clone(resolver.cache());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = cache.sweep(Utc::now());
                if evicted > 0 {
                    debug!("Evicted {} expired cache entries", evicted);
                }
            }
        });
        loop {
            let mut buf = vec![0u8; 1500];
            // A receive error (ICMP-surfaced or transient) must not take
            // the server down; log it and keep serving.
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Failed to receive DNS query: {}", e);
                    continue;
                }
            };
            buf.truncate(len);

            let socket = Arc::clone(&socket);
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                match handle_query(&resolver, &buf, Utc::now()) {
                    Some(reply) => {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            warn!("Failed to send DNS reply to {}: {}", peer, e);
                        }
                    }
                    None => debug!("Dropped unparseable datagram from {}", peer),
                }
            });
        }
    }
}

/// Processes one query datagram and builds the reply bytes.
///
/// Returns `None` when the datagram must be dropped silently (header too
/// short to echo an id, or a response packet arriving on the query port).
pub fn handle_query(resolver: &Resolver, data: &[u8], now: DateTime<Utc>) -> Option<Vec<u8>> {
    let header = match Header::parse(data) {
        Ok(header) => header,
        Err(_) => return None,
    };
    if header.is_response {
        return None;
    }

    let query = match DnsQuery::parse(data) {
        Ok(query) => query,
        Err(e) => {
            debug!("Malformed query {:#06x}: {}", header.id, e);
            return encode_or_drop(DnsResponse::format_error(header.id));
        }
    };

    // Only standard queries with exactly one IN-class question.
    if query.header.opcode != 0 || query.questions.len() != 1 {
        return encode_or_drop(DnsResponse::format_error(header.id));
    }
    let question = &query.questions[0];
    if question.qclass != CLASS_IN {
        return encode_or_drop(DnsResponse::format_error(header.id));
    }

    let Some(rtype) = question.record_type() else {
        // Unknown type: well-formed question, empty NOERROR answer.
        return encode_or_drop(DnsResponse::for_query(&query, Rcode::NoError, false));
    };

    let response = match resolver.resolve(&question.name, rtype, now) {
        Resolution::Answered {
            records,
            authoritative,
        } => {
            let mut response = DnsResponse::for_query(&query, Rcode::NoError, authoritative);
            response.answers = records;
            response
        }
        Resolution::NxDomain { soa } => {
            let mut response = DnsResponse::for_query(&query, Rcode::NxDomain, soa.is_some());
            response.authorities.extend(soa);
            response
        }
        Resolution::ServFail => DnsResponse::for_query(&query, Rcode::ServFail, false),
    };

    encode_or_drop(response)
}

fn encode_or_drop(response: DnsResponse) -> Option<Vec<u8>> {
    match response.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode DNS reply: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::DnsCache;
    use crate::dns::record::{RecordData, RecordType, ResourceRecord, Soa, Zone};
    use crate::dns::store::RecordStore;
    use crate::dns::wire::encode_name;

    fn test_resolver() -> Resolver {
        let zone = Zone {
            name: "example.test".to_string(),
            soa: Soa {
                primary_ns: "ns1.example.test".to_string(),
                responsible: "hostmaster.example.test".to_string(),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum_ttl: 60,
            },
            records: vec![ResourceRecord::new(
                "example.test",
                300,
                RecordData::A(Ipv4Addr::new(93, 184, 216, 34)),
            )],
        };
        Resolver::new(
            Arc::new(RecordStore::with_zones(vec![zone]).unwrap()),
            Arc::new(DnsCache::new()),
        )
    }

    fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&0x0100u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 6]);
        encode_name(name, &mut data).unwrap();
        data.extend_from_slice(&qtype.to_be_bytes());
        data.extend_from_slice(&CLASS_IN.to_be_bytes());
        data
    }

    #[test]
    fn test_answered_query() {
        let resolver = test_resolver();
        let query = build_query(0x1111, "example.test", RecordType::A.code());

        let reply = handle_query(&resolver, &query, Utc::now()).unwrap();
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.id, 0x1111);
        assert!(header.is_response);
        assert!(header.authoritative);
        assert_eq!(header.rcode, Rcode::NoError);
        assert_eq!(header.answer_count, 1);
    }

    #[test]
    fn test_nxdomain_reply_carries_soa_authority() {
        let resolver = test_resolver();
        let query = build_query(0x2222, "missing.example.test", RecordType::A.code());

        let reply = handle_query(&resolver, &query, Utc::now()).unwrap();
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.rcode, Rcode::NxDomain);
        assert_eq!(header.answer_count, 0);
        assert_eq!(header.authority_count, 1);
    }

    #[test]
    fn test_servfail_reply() {
        let resolver = test_resolver();
        let query = build_query(0x3333, "nowhere.invalid", RecordType::A.code());

        let reply = handle_query(&resolver, &query, Utc::now()).unwrap();
        assert_eq!(Header::parse(&reply).unwrap().rcode, Rcode::ServFail);
    }

    #[test]
    fn test_unknown_qtype_gets_empty_noerror() {
        let resolver = test_resolver();
        let query = build_query(0x4444, "example.test", 99);

        let reply = handle_query(&resolver, &query, Utc::now()).unwrap();
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.rcode, Rcode::NoError);
        assert_eq!(header.answer_count, 0);
    }

    #[test]
    fn test_malformed_body_gets_formerr() {
        let resolver = test_resolver();
        let mut query = build_query(0x5555, "example.test", RecordType::A.code());
        query.truncate(query.len() - 3);

        let reply = handle_query(&resolver, &query, Utc::now()).unwrap();
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.id, 0x5555);
        assert_eq!(header.rcode, Rcode::FormErr);
    }

    #[test]
    fn test_short_datagram_dropped() {
        let resolver = test_resolver();
        assert!(handle_query(&resolver, &[0u8; 7], Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_serve_survives_bad_datagrams() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let server = DnsServer::new(
            Arc::new(test_resolver()),
            Ipv4Addr::LOCALHOST,
            server_addr.port(),
        );
        let task = tokio::spawn(server.serve(socket));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xff; 3], server_addr).await.unwrap();

        // The server still answers after the junk datagram.
        let query = build_query(0x7777, "example.test", RecordType::A.code());
        client.send_to(&query, server_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(Header::parse(&buf[..len]).unwrap().id, 0x7777);
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn test_response_packet_dropped() {
        let resolver = test_resolver();
        let mut query = build_query(0x6666, "example.test", RecordType::A.code());
        query[2] |= 0x80;
        assert!(handle_query(&resolver, &query, Utc::now()).is_none());
    }
}
