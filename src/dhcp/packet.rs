//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A packet is a 236-byte fixed header, the 4-byte magic cookie, then
//! TLV options. The sname and file fields are carried as zero padding;
//! option overload into them is not supported, so a packet relying on
//! Option 52 parses without those overflow options.

use std::net::Ipv4Addr;

use crate::dhcp::options::{DhcpOption, MessageType, OptionCode};
use crate::dhcp::MacAddr;
use crate::error::{Error, Result};

/// Identifies DHCP (vs plain BOOTP) packets.
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Offset of the magic cookie: the fixed RFC 2131 header is 236 bytes.
const MAGIC_COOKIE_OFFSET: usize = 236;

/// Fixed header plus cookie.
const FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Minimum encoded packet size, for BOOTP relay compatibility.
pub const MIN_PACKET_SIZE: usize = 300;

/// Relay hop ceiling per RFC 2131 §4.1; packets beyond it are dropped.
pub const MAX_HOPS: u8 = 16;

/// BOOTP op code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP op code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Ethernet hardware type.
pub const HTYPE_ETHERNET: u8 = 1;

/// Ethernet hardware address length.
pub const HLEN_ETHERNET: u8 = 6;

const SNAME_SIZE: usize = 64;
const FILE_SIZE: usize = 128;

/// A parsed DHCP packet, request or reply.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    /// Incremented by each relay the packet crosses.
    pub hops: u8,
    /// Client-chosen transaction id, echoed in every reply.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 is the broadcast flag.
    pub flags: u16,
    /// Client's current address, set when RENEWING or releasing.
    pub ciaddr: Ipv4Addr,
    /// Address being assigned to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; zero when the client is on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

fn read_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

impl DhcpPacket {
    /// Parses a packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the packet is shorter than
    /// 240 bytes, the magic cookie is wrong, the hop count exceeds
    /// [`MAX_HOPS`], the hlen does not match an Ethernet htype, or the
    /// options section is truncated.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..FIXED_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let hops = data[3];
        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        let htype = data[1];
        let hlen = data[2];
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet",
                hlen
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        Ok(Self {
            op: data[0],
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_addr(data, 12),
            yiaddr: read_addr(data, 16),
            siaddr: read_addr(data, 20),
            giaddr: read_addr(data, 24),
            chaddr,
            options: Self::parse_options(&data[FIXED_HEADER_SIZE..])?,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];
            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }
            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };
            let length = length as usize;
            let end = index + 2 + length;
            if end > data.len() {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            }

            options.push(DhcpOption::parse(code, &data[index + 2..end])?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes for transmission, padded to [`MIN_PACKET_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PACKET_SIZE + 64);

        out.push(self.op);
        out.push(self.htype);
        out.push(self.hlen);
        out.push(self.hops);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&self.siaddr.octets());
        out.extend_from_slice(&self.giaddr.octets());
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&[0u8; SNAME_SIZE]);
        out.extend_from_slice(&[0u8; FILE_SIZE]);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            out.extend_from_slice(&option.encode());
        }
        out.push(OptionCode::End as u8);

        out.resize(out.len().max(MIN_PACKET_SIZE), 0);
        out
    }

    /// The client's hardware address, when the packet carries an
    /// Ethernet-sized one.
    pub fn mac(&self) -> Option<MacAddr> {
        if self.hlen >= HLEN_ETHERNET {
            MacAddr::from_bytes(&self.chaddr)
        } else {
            None
        }
    }

    /// Option 53, absent for plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Option 50.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 54.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 55.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// Option 82, echoed verbatim in replies.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    /// True when the client asked for broadcast replies.
    pub fn is_broadcast(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Builds a reply to `request`, preserving xid, flags, giaddr,
    /// chaddr, and hardware type. The message type becomes the first
    /// option.
    pub fn reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = Vec::with_capacity(options.len() + 1);
        all_options.push(DhcpOption::MessageType(message_type));
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: all_options,
        }
    }
}
