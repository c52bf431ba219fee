//! DORA state machine: turns parsed client packets into replies.
//!
//! The engine owns no sockets. It takes a parsed [`DhcpPacket`] plus the
//! current time and returns the reply to send, if any, so the whole
//! exchange is testable without the network. A NAK never mutates pool
//! state; the failed commit or renew leaves every lease exactly as it
//! was.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dhcp::options::{DhcpOption, MessageType, OptionCode};
use crate::dhcp::packet::{DhcpPacket, BOOTREQUEST};
use crate::dhcp::pool::{Lease, LeasePool, LeaseState};
use crate::dhcp::MacAddr;

/// Network parameters handed to clients in replies.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// This server's address, sent as Option 54 and used to recognize
    /// REQUESTs addressed to other servers.
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Default gateway for clients; the server itself when unset.
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
}

impl EngineSettings {
    fn broadcast_address(&self) -> Ipv4Addr {
        let addr = u32::from(self.server_ip) | !u32::from(self.subnet_mask);
        Ipv4Addr::from(addr)
    }

    fn router(&self) -> Ipv4Addr {
        self.gateway.unwrap_or(self.server_ip)
    }
}

/// Options a reply always carries even when the client's parameter
/// request list leaves them out.
const ALWAYS_SENT: [u8; 6] = [
    OptionCode::MessageType as u8,
    OptionCode::ServerIdentifier as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::RenewalTime as u8,
    OptionCode::RebindingTime as u8,
    OptionCode::RelayAgentInfo as u8,
];

pub struct DhcpEngine {
    settings: EngineSettings,
    pool: Arc<LeasePool>,
}

impl DhcpEngine {
    pub fn new(settings: EngineSettings, pool: Arc<LeasePool>) -> Self {
        Self { settings, pool }
    }

    pub fn pool(&self) -> &Arc<LeasePool> {
        &self.pool
    }

    /// Handles one client packet and returns the reply, or `None` when
    /// the exchange produces no reply (RELEASE, DECLINE, packets for
    /// other servers, or junk). A DISCOVER against an exhausted pool is
    /// NAKed so the client learns its fate immediately.
    pub async fn handle_packet(
        &self,
        request: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Option<DhcpPacket> {
        if request.op != BOOTREQUEST {
            debug!("Ignoring non-request packet (op {})", request.op);
            return None;
        }
        let Some(mac) = request.mac() else {
            warn!("Dropping packet without a usable hardware address");
            return None;
        };
        if mac.is_zero() {
            warn!("Dropping packet with an all-zero hardware address");
            return None;
        }
        let Some(message_type) = request.message_type() else {
            debug!("Ignoring packet from {} without a message type", mac);
            return None;
        };

        debug!("{} from {} (xid {:#010x})", message_type, mac, request.xid);

        match message_type {
            MessageType::Discover => self.handle_discover(request, mac, now).await,
            MessageType::Request => self.handle_request(request, mac, now).await,
            MessageType::Release => self.handle_release(request, mac, now).await,
            MessageType::Decline => self.handle_decline(request, mac).await,
            MessageType::Inform => self.handle_inform(request, mac),
            MessageType::Offer | MessageType::Ack | MessageType::Nak => {
                debug!("Ignoring server-to-client message from {}", mac);
                None
            }
        }
    }

    async fn handle_discover(
        &self,
        request: &DhcpPacket,
        mac: MacAddr,
        now: DateTime<Utc>,
    ) -> Option<DhcpPacket> {
        let requested = request.requested_ip();
        match self.pool.offer(mac, requested, request.xid, now).await {
            Ok(lease) => {
                info!("Offering {} to {}", lease.ip, mac);
                Some(self.build_reply(request, MessageType::Offer, &lease, now))
            }
            Err(error) => {
                // The client still gets a definitive reply instead of
                // waiting out its own timeout.
                warn!("No address to offer {}: {}", mac, error);
                Some(self.build_nak(request))
            }
        }
    }

    async fn handle_request(
        &self,
        request: &DhcpPacket,
        mac: MacAddr,
        now: DateTime<Utc>,
    ) -> Option<DhcpPacket> {
        if let Some(server_id) = request.server_identifier() {
            if server_id != self.settings.server_ip {
                debug!("REQUEST from {} addressed to {}, ignoring", mac, server_id);
                return None;
            }
        }

        if let Some(requested) = request.requested_ip() {
            // SELECTING or INIT-REBOOT: the client names the address.
            return match self.pool.commit(mac, requested, request.xid, now).await {
                Ok(lease) => {
                    info!("Acknowledged {} for {}", lease.ip, mac);
                    Some(self.build_reply(request, MessageType::Ack, &lease, now))
                }
                Err(error) => {
                    warn!("Rejecting REQUEST for {} from {}: {}", requested, mac, error);
                    Some(self.build_nak(request))
                }
            };
        }

        if !request.ciaddr.is_unspecified() {
            // RENEWING or REBINDING: the address rides in ciaddr.
            return match self.pool.renew(mac, request.ciaddr, now).await {
                Ok(lease) => {
                    info!("Renewed {} for {}", lease.ip, mac);
                    Some(self.build_reply(request, MessageType::Ack, &lease, now))
                }
                Err(error) => {
                    warn!("Rejecting renewal of {} from {}: {}", request.ciaddr, mac, error);
                    Some(self.build_nak(request))
                }
            };
        }

        warn!("REQUEST from {} names no address, rejecting", mac);
        Some(self.build_nak(request))
    }

    async fn handle_release(
        &self,
        request: &DhcpPacket,
        mac: MacAddr,
        now: DateTime<Utc>,
    ) -> Option<DhcpPacket> {
        if request.ciaddr.is_unspecified() {
            warn!("RELEASE from {} without ciaddr, ignoring", mac);
            return None;
        }
        match self.pool.release(mac, request.ciaddr, now).await {
            Ok(lease) => info!("Released {} from {}", lease.ip, mac),
            Err(error) => warn!("RELEASE of {} from {} failed: {}", request.ciaddr, mac, error),
        }
        // RELEASE is never answered.
        None
    }

    async fn handle_decline(&self, request: &DhcpPacket, mac: MacAddr) -> Option<DhcpPacket> {
        let Some(declined) = request.requested_ip() else {
            warn!("DECLINE from {} without an address, ignoring", mac);
            return None;
        };
        if let Err(error) = self.pool.decline(mac, declined).await {
            warn!("DECLINE of {} from {} failed: {}", declined, mac, error);
        }
        None
    }

    /// INFORM gets configuration without touching the lease table.
    fn handle_inform(&self, request: &DhcpPacket, mac: MacAddr) -> Option<DhcpPacket> {
        info!("Answering INFORM from {}", mac);
        let options = self.filter_options(request, self.network_options(request));
        let mut reply = DhcpPacket::reply(
            request,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.settings.server_ip,
            options,
        );
        reply.ciaddr = request.ciaddr;
        Some(reply)
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> DhcpPacket {
        // RFC 2131 T1/T2 defaults: half and seven eighths of the lease.
        let duration = match lease.state {
            LeaseState::Bound => lease.remaining_seconds(now) as u32,
            _ => self.offered_duration(),
        };
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.settings.server_ip),
            DhcpOption::LeaseTime(duration),
            DhcpOption::RenewalTime(duration / 2),
            DhcpOption::RebindingTime(duration / 8 * 7),
        ];
        options.extend(self.network_options(request));
        let options = self.filter_options(request, options);

        DhcpPacket::reply(request, message_type, lease.ip, self.settings.server_ip, options)
    }

    /// Duration advertised in an OFFER, before the lease is bound.
    fn offered_duration(&self) -> u32 {
        // The pool binds for its configured duration on commit; quote
        // the same figure up front.
        self.pool.lease_duration_seconds()
    }

    fn network_options(&self, request: &DhcpPacket) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::SubnetMask(self.settings.subnet_mask),
            DhcpOption::BroadcastAddress(self.settings.broadcast_address()),
            DhcpOption::Router(vec![self.settings.router()]),
        ];
        if !self.settings.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(self.settings.dns_servers.clone()));
        }
        if let Some(domain) = &self.settings.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
        if let Some(info) = request.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(info.to_vec()));
        }
        options
    }

    /// Applies the client's parameter request list, keeping the options
    /// every reply must carry regardless.
    fn filter_options(&self, request: &DhcpPacket, options: Vec<DhcpOption>) -> Vec<DhcpOption> {
        let Some(prl) = request.parameter_request_list() else {
            return options;
        };
        options
            .into_iter()
            .filter(|option| {
                let code = option.option_code();
                ALWAYS_SENT.contains(&code) || prl.contains(&code)
            })
            .collect()
    }

    fn build_nak(&self, request: &DhcpPacket) -> DhcpPacket {
        DhcpPacket::reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.settings.server_ip,
            vec![DhcpOption::ServerIdentifier(self.settings.server_ip)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::packet::tests::build_request;
    use crate::dhcp::pool::{LeaseState, PoolSettings};
    use std::collections::{HashMap, HashSet};

    fn test_engine() -> DhcpEngine {
        let pool = LeasePool::new(PoolSettings {
            range_start: Ipv4Addr::new(192, 168, 1, 10),
            range_end: Ipv4Addr::new(192, 168, 1, 20),
            excluded: HashSet::new(),
            reservations: HashMap::new(),
            lease_duration_seconds: 3600,
            offer_timeout_seconds: 60,
            reuse_grace_seconds: 0,
        });
        DhcpEngine::new(
            EngineSettings {
                server_ip: Ipv4Addr::new(192, 168, 1, 1),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
                dns_servers: vec![Ipv4Addr::new(192, 168, 1, 1)],
                domain_name: Some("example.test".to_string()),
            },
            Arc::new(pool),
        )
    }

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn parse(data: Vec<u8>) -> DhcpPacket {
        DhcpPacket::parse(&data).unwrap()
    }

    fn lease_time(packet: &DhcpPacket) -> Option<u32> {
        packet.options.iter().find_map(|option| match option {
            DhcpOption::LeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_discover_produces_offer() {
        let engine = test_engine();
        let now = Utc::now();
        let discover = parse(build_request(MessageType::Discover, MAC, 1, vec![]));

        let offer = engine.handle_packet(&discover, now).await.unwrap();
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(offer.xid, 1);
        assert_eq!(lease_time(&offer), Some(3600));
        assert_eq!(
            offer.server_identifier(),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
    }

    #[tokio::test]
    async fn test_zero_hardware_address_ignored() {
        let engine = test_engine();
        let discover = parse(build_request(MessageType::Discover, [0u8; 6], 1, vec![]));
        assert!(engine.handle_packet(&discover, Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_full_dora_exchange() {
        let engine = test_engine();
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 7, vec![]));
        let offer = engine.handle_packet(&discover, now).await.unwrap();
        let offered_ip = offer.yiaddr;

        let request = parse(build_request(
            MessageType::Request,
            MAC,
            7,
            vec![
                DhcpOption::RequestedIpAddress(offered_ip),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1)),
            ],
        ));
        let ack = engine.handle_packet(&request, now).await.unwrap();

        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offered_ip);
        assert_eq!(lease_time(&ack), Some(3600));
        let t1 = ack.options.iter().find_map(|option| match option {
            DhcpOption::RenewalTime(secs) => Some(*secs),
            _ => None,
        });
        let t2 = ack.options.iter().find_map(|option| match option {
            DhcpOption::RebindingTime(secs) => Some(*secs),
            _ => None,
        });
        assert_eq!(t1, Some(1800));
        assert_eq!(t2, Some(3150));

        let lease = engine.pool().lease_for(MacAddr::new(MAC)).await.unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
    }

    #[tokio::test]
    async fn test_request_for_foreign_server_ignored() {
        let engine = test_engine();
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 2, vec![]));
        let offer = engine.handle_packet(&discover, now).await.unwrap();

        let request = parse(build_request(
            MessageType::Request,
            MAC,
            2,
            vec![
                DhcpOption::RequestedIpAddress(offer.yiaddr),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            ],
        ));
        assert!(engine.handle_packet(&request, now).await.is_none());

        // The offer survives untouched for when the client comes back.
        let lease = engine.pool().lease_for(MacAddr::new(MAC)).await.unwrap();
        assert_eq!(lease.state, LeaseState::Offered);
    }

    #[tokio::test]
    async fn test_request_without_offer_gets_nak() {
        let engine = test_engine();
        let request = parse(build_request(
            MessageType::Request,
            MAC,
            3,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 10))],
        ));

        let nak = engine.handle_packet(&request, Utc::now()).await.unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[tokio::test]
    async fn test_mismatched_request_naks_without_mutation() {
        let engine = test_engine();
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 4, vec![]));
        let offer = engine.handle_packet(&discover, now).await.unwrap();

        // The client asks for an address it was never offered.
        let wrong = Ipv4Addr::new(192, 168, 1, 19);
        assert_ne!(offer.yiaddr, wrong);
        let request = parse(build_request(
            MessageType::Request,
            MAC,
            4,
            vec![DhcpOption::RequestedIpAddress(wrong)],
        ));
        let nak = engine.handle_packet(&request, now).await.unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));

        // The original offer is still live.
        let lease = engine.pool().lease_for(MacAddr::new(MAC)).await.unwrap();
        assert_eq!(lease.state, LeaseState::Offered);
        assert_eq!(lease.ip, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_renewal_via_ciaddr() {
        let engine = test_engine();
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 5, vec![]));
        let offer = engine.handle_packet(&discover, now).await.unwrap();
        let request = parse(build_request(
            MessageType::Request,
            MAC,
            5,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        ));
        engine.handle_packet(&request, now).await.unwrap();

        let mut renewal_data = build_request(MessageType::Request, MAC, 6, vec![]);
        renewal_data[12..16].copy_from_slice(&offer.yiaddr.octets());
        let renewal = parse(renewal_data);

        let later = now + chrono::TimeDelta::seconds(1800);
        let ack = engine.handle_packet(&renewal, later).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
        assert_eq!(lease_time(&ack), Some(3600));
    }

    #[tokio::test]
    async fn test_release_frees_address_silently() {
        let engine = test_engine();
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 8, vec![]));
        let offer = engine.handle_packet(&discover, now).await.unwrap();
        let request = parse(build_request(
            MessageType::Request,
            MAC,
            8,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        ));
        engine.handle_packet(&request, now).await.unwrap();

        let mut release_data = build_request(MessageType::Release, MAC, 9, vec![]);
        release_data[12..16].copy_from_slice(&offer.yiaddr.octets());
        let release = parse(release_data);

        assert!(engine.handle_packet(&release, now).await.is_none());
        assert!(engine.pool().lease_for(MacAddr::new(MAC)).await.is_none());

        // The address goes back to the front of the free list.
        let other_mac = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let discover = parse(build_request(MessageType::Discover, other_mac, 10, vec![]));
        let next = engine.handle_packet(&discover, now).await.unwrap();
        assert_eq!(next.yiaddr, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_inform_answers_without_lease() {
        let engine = test_engine();
        let mut inform_data = build_request(MessageType::Inform, MAC, 11, vec![]);
        inform_data[12..16].copy_from_slice(&[192, 168, 1, 50]);
        let inform = parse(inform_data);

        let ack = engine.handle_packet(&inform, Utc::now()).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(ack.ciaddr, Ipv4Addr::new(192, 168, 1, 50));
        assert!(lease_time(&ack).is_none());
        assert!(engine.pool().lease_for(MacAddr::new(MAC)).await.is_none());
    }

    #[tokio::test]
    async fn test_parameter_request_list_filters_reply() {
        let engine = test_engine();
        let discover = parse(build_request(
            MessageType::Discover,
            MAC,
            12,
            vec![DhcpOption::ParameterRequestList(vec![
                OptionCode::SubnetMask as u8,
            ])],
        ));

        let offer = engine.handle_packet(&discover, Utc::now()).await.unwrap();
        let codes: Vec<u8> = offer.options.iter().map(DhcpOption::option_code).collect();
        assert!(codes.contains(&(OptionCode::SubnetMask as u8)));
        assert!(!codes.contains(&(OptionCode::Router as u8)));
        assert!(!codes.contains(&(OptionCode::DnsServer as u8)));
        // Lease bookkeeping options are sent regardless of the list.
        assert!(codes.contains(&(OptionCode::LeaseTime as u8)));
        assert!(codes.contains(&(OptionCode::ServerIdentifier as u8)));
    }

    #[tokio::test]
    async fn test_relay_agent_info_echoed() {
        let engine = test_engine();
        let info = vec![1, 4, 0xde, 0xad, 0xbe, 0xef];
        let discover = parse(build_request(
            MessageType::Discover,
            MAC,
            13,
            vec![DhcpOption::RelayAgentInfo(info.clone())],
        ));

        let offer = engine.handle_packet(&discover, Utc::now()).await.unwrap();
        assert_eq!(offer.relay_agent_info(), Some(info.as_slice()));
    }

    #[tokio::test]
    async fn test_exhausted_pool_naks_discover() {
        let pool = LeasePool::new(PoolSettings {
            range_start: Ipv4Addr::new(192, 168, 1, 10),
            range_end: Ipv4Addr::new(192, 168, 1, 10),
            excluded: HashSet::new(),
            reservations: HashMap::new(),
            lease_duration_seconds: 3600,
            offer_timeout_seconds: 60,
            reuse_grace_seconds: 0,
        });
        let engine = DhcpEngine::new(
            EngineSettings {
                server_ip: Ipv4Addr::new(192, 168, 1, 1),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
                dns_servers: vec![],
                domain_name: None,
            },
            Arc::new(pool),
        );
        let now = Utc::now();

        let discover = parse(build_request(MessageType::Discover, MAC, 1, vec![]));
        assert!(engine.handle_packet(&discover, now).await.is_some());

        let other = parse(build_request(
            MessageType::Discover,
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            2,
            vec![],
        ));
        let nak = engine.handle_packet(&other, now).await.unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
    }
}
