//! UDP front end for the lease engine.
//!
//! Listens on port 67 with a broadcast-capable socket, hands each
//! datagram to the engine on its own task, and routes replies per RFC
//! 2131 §4.1: via the relay when giaddr is set, broadcast for NAKs and
//! address-less clients, unicast otherwise. A background task sweeps the
//! pool for timed-out offers and expired leases.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dhcp::engine::DhcpEngine;
use crate::dhcp::options::MessageType;
use crate::dhcp::packet::DhcpPacket;
use crate::error::Result;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Ethernet MTU; no DHCP datagram this server emits comes close.
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    engine: Arc<DhcpEngine>,
    bind_ip: Ipv4Addr,
    sweep_interval: Duration,
}

impl DhcpServer {
    pub fn new(engine: Arc<DhcpEngine>) -> Self {
        Self {
            engine,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_bind_ip(mut self, bind_ip: Ipv4Addr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub async fn run(&self) -> Result<()> {
        let socket = create_broadcast_socket((self.bind_ip, SERVER_PORT).into())?;
        info!("DHCP server listening on {}:{}", self.bind_ip, SERVER_PORT);
        self.serve(socket).await
    }

    /// Serves requests on an already-bound socket.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let pool = Arc::clone(self.engine.pool());
        let sweep_interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                match pool.expire_sweep(Utc::now()).await {
                    Ok(report) if report.total() > 0 => info!(
                        "Sweep: {} offer(s) reclaimed, {} lease(s) expired, {} address(es) freed",
                        report.offers_reclaimed,
                        report.leases_expired,
                        report.addresses_reclaimed
                    ),
                    Ok(_) => {}
                    Err(error) => warn!("Lease sweep failed: {}", error),
                }
            }
        });

        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            // A receive error must not take the server down; log it and
            // keep serving.
            let (length, peer) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(error) => {
                    warn!("Failed to receive DHCP packet: {}", error);
                    continue;
                }
            };
            let data = buffer[..length].to_vec();
            let engine = Arc::clone(&self.engine);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Err(error) = handle_datagram(engine, socket, data, peer).await {
                    warn!("Failed to handle packet from {}: {}", peer, error);
                }
            });
        }
    }
}

async fn handle_datagram(
    engine: Arc<DhcpEngine>,
    socket: Arc<UdpSocket>,
    data: Vec<u8>,
    peer: SocketAddr,
) -> Result<()> {
    let request = DhcpPacket::parse(&data)?;
    let request_ciaddr = request.ciaddr;

    let Some(reply) = engine.handle_packet(&request, Utc::now()).await else {
        return Ok(());
    };

    let destination = reply_destination(&reply, request_ciaddr);
    socket.send_to(&reply.encode(), destination).await?;
    debug!(
        "Sent {} (xid {:#010x}) to {}",
        reply
            .message_type()
            .map_or_else(|| "reply".to_string(), |t| t.to_string()),
        reply.xid,
        destination
    );
    Ok(())
}

/// Where a reply goes: back through the relay when the request crossed
/// one, broadcast when the client cannot yet receive unicast, otherwise
/// straight to the client's current address.
fn reply_destination(reply: &DhcpPacket, request_ciaddr: Ipv4Addr) -> SocketAddr {
    if !reply.giaddr.is_unspecified() {
        return (reply.giaddr, SERVER_PORT).into();
    }
    let is_nak = reply.message_type() == Some(MessageType::Nak);
    if is_nak || reply.is_broadcast() || request_ciaddr.is_unspecified() {
        (Ipv4Addr::BROADCAST, CLIENT_PORT).into()
    } else {
        (request_ciaddr, CLIENT_PORT).into()
    }
}

/// Builds the listening socket. DHCP needs broadcast sends and benefits
/// from address reuse across restarts, which plain
/// [`UdpSocket::bind`](tokio::net::UdpSocket::bind) cannot provide.
pub fn create_broadcast_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::options::{DhcpOption, MessageType};
    use crate::dhcp::packet::tests::build_request;

    fn reply_for(message_type: MessageType, flags: u16, giaddr: Ipv4Addr) -> DhcpPacket {
        let mut data = build_request(MessageType::Request, [1, 2, 3, 4, 5, 6], 1, vec![]);
        data[10..12].copy_from_slice(&flags.to_be_bytes());
        data[24..28].copy_from_slice(&giaddr.octets());
        let request = DhcpPacket::parse(&data).unwrap();
        DhcpPacket::reply(
            &request,
            message_type,
            Ipv4Addr::new(192, 168, 1, 50),
            Ipv4Addr::new(192, 168, 1, 1),
            vec![DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1))],
        )
    }

    #[test]
    fn test_relayed_reply_goes_to_giaddr() {
        let giaddr = Ipv4Addr::new(192, 168, 2, 1);
        let reply = reply_for(MessageType::Ack, 0, giaddr);
        assert_eq!(
            reply_destination(&reply, Ipv4Addr::new(192, 168, 1, 50)),
            SocketAddr::from((giaddr, SERVER_PORT))
        );
    }

    #[test]
    fn test_nak_always_broadcast() {
        let reply = reply_for(MessageType::Nak, 0, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply_destination(&reply, Ipv4Addr::new(192, 168, 1, 50)),
            SocketAddr::from((Ipv4Addr::BROADCAST, CLIENT_PORT))
        );
    }

    #[test]
    fn test_broadcast_flag_honored() {
        let reply = reply_for(MessageType::Offer, 0x8000, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply_destination(&reply, Ipv4Addr::UNSPECIFIED),
            SocketAddr::from((Ipv4Addr::BROADCAST, CLIENT_PORT))
        );
    }

    #[test]
    fn test_renewal_reply_unicast_to_ciaddr() {
        let reply = reply_for(MessageType::Ack, 0, Ipv4Addr::UNSPECIFIED);
        let ciaddr = Ipv4Addr::new(192, 168, 1, 50);
        assert_eq!(
            reply_destination(&reply, ciaddr),
            SocketAddr::from((ciaddr, CLIENT_PORT))
        );
    }

    #[tokio::test]
    async fn test_serve_survives_bad_datagrams() {
        use crate::dhcp::engine::EngineSettings;
        use crate::dhcp::pool::{LeasePool, PoolSettings};
        use std::collections::{HashMap, HashSet};

        let pool = LeasePool::new(PoolSettings {
            range_start: Ipv4Addr::new(192, 168, 1, 10),
            range_end: Ipv4Addr::new(192, 168, 1, 20),
            excluded: HashSet::new(),
            reservations: HashMap::new(),
            lease_duration_seconds: 3600,
            offer_timeout_seconds: 60,
            reuse_grace_seconds: 0,
        });
        let engine = Arc::new(DhcpEngine::new(
            EngineSettings {
                server_ip: Ipv4Addr::new(192, 168, 1, 1),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
                dns_servers: vec![Ipv4Addr::new(192, 168, 1, 1)],
                domain_name: None,
            },
            Arc::new(pool),
        ));
        let server = DhcpServer::new(engine).with_sweep_interval(Duration::from_secs(3600));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move { server.serve(socket).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0u8; 10], server_addr).await.unwrap();
        let discover = build_request(MessageType::Discover, [1, 2, 3, 4, 5, 6], 7, vec![]);
        client.send_to(&discover, server_addr).await.unwrap();

        // Neither the junk datagram nor the failed broadcast reply
        // brings the receive loop down.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn test_client_without_address_gets_broadcast() {
        let reply = reply_for(MessageType::Offer, 0, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply_destination(&reply, Ipv4Addr::UNSPECIFIED),
            SocketAddr::from((Ipv4Addr::BROADCAST, CLIENT_PORT))
        );
    }
}
