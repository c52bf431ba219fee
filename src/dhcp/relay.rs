//! Relay agent: forwards client broadcasts to far-side DHCP servers and
//! carries replies back onto the client subnet.
//!
//! Transmission goes through the [`RelayTransport`] trait so forwarding
//! logic is testable without sockets. Sends are retried a bounded number
//! of times; when every attempt fails the error surfaces as
//! [`Error::Timeout`] rather than being dropped on the floor.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dhcp::packet::{DhcpPacket, BOOTREPLY, BOOTREQUEST, MAX_HOPS};
use crate::error::{Error, Result};

pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where relayed packets leave through.
pub trait RelayTransport: Send + Sync {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<()>;
}

impl RelayTransport for std::net::UdpSocket {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        self.send_to(data, destination)?;
        Ok(())
    }
}

/// Forwards DHCP traffic between a client subnet and remote servers.
pub struct RelayForwarder<T: RelayTransport> {
    transport: T,
    /// This relay's address on the client subnet, stamped into giaddr.
    relay_ip: Ipv4Addr,
    /// Far-side servers every client request is forwarded to.
    servers: Vec<SocketAddr>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<T: RelayTransport> RelayForwarder<T> {
    pub fn new(transport: T, relay_ip: Ipv4Addr, servers: Vec<SocketAddr>) -> Self {
        Self {
            transport,
            relay_ip,
            servers,
            max_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Forwards a client request to every configured server, stamping
    /// giaddr with this relay's address when no earlier relay has, and
    /// counting the hop.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] for replies or packets at the hop limit,
    /// [`Error::Timeout`] when a server remains unreachable after every
    /// retry. Other servers are still attempted first.
    pub async fn forward_request(&self, request: &DhcpPacket) -> Result<()> {
        if request.op != BOOTREQUEST {
            return Err(Error::InvalidPacket(
                "Relay can only forward client requests upstream".to_string(),
            ));
        }
        if request.hops >= MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop limit reached ({} hops)",
                request.hops
            )));
        }

        let mut forwarded = request.clone();
        forwarded.hops += 1;
        if forwarded.giaddr.is_unspecified() {
            forwarded.giaddr = self.relay_ip;
        }
        let data = forwarded.encode();

        debug!(
            "Relaying request (xid {:#010x}, hop {}) to {} server(s)",
            forwarded.xid,
            forwarded.hops,
            self.servers.len()
        );

        let mut failure = None;
        for &server in &self.servers {
            if let Err(error) = self.send_with_retry(&data, server).await {
                warn!("Forwarding to {} failed: {}", server, error);
                failure = Some(error);
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Carries a server reply back onto the client subnet: broadcast
    /// when the client asked for it or has no address yet, unicast to
    /// the assigned address otherwise.
    pub async fn forward_reply(&self, reply: &DhcpPacket) -> Result<()> {
        if reply.op != BOOTREPLY {
            return Err(Error::InvalidPacket(
                "Relay can only forward server replies downstream".to_string(),
            ));
        }

        let destination: SocketAddr = if reply.is_broadcast() || reply.yiaddr.is_unspecified() {
            (Ipv4Addr::BROADCAST, 68).into()
        } else {
            (reply.yiaddr, 68).into()
        };

        info!(
            "Relaying reply (xid {:#010x}) to {}",
            reply.xid, destination
        );
        self.send_with_retry(&reply.encode(), destination).await
    }

    async fn send_with_retry(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.transport.send(data, destination) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        "Send to {} failed (attempt {}/{}): {}",
                        destination, attempt, self.max_attempts, error
                    );
                    last_error = Some(error);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(Error::Timeout {
            message: format!(
                "Giving up on {} after {} attempt(s): {}",
                destination,
                self.max_attempts,
                last_error.map_or_else(|| "no error recorded".to_string(), |e| e.to_string())
            ),
            attempts: self.max_attempts,
        })
    }
}
