//! DHCP options (RFC 2132) in TLV form.
//!
//! Only the options this server emits or inspects get typed variants;
//! anything else is carried opaquely as [`DhcpOption::Unknown`] so relayed
//! packets survive a round trip intact.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// A 1-byte length field caps option data at 255 bytes, so at most 63
/// IPv4 addresses fit in a list option.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Option codes this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53) per RFC 2131 §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        write!(f, "{}", name)
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    /// Option 50: IP the client asks for in DISCOVER/REQUEST.
    RequestedIpAddress(Ipv4Addr),
    /// Option 51: lease duration in seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    /// Option 54: which server's offer a REQUEST accepts.
    ServerIdentifier(Ipv4Addr),
    /// Option 55: codes the client wants in the reply.
    ParameterRequestList(Vec<u8>),
    /// Option 58: T1.
    RenewalTime(u32),
    /// Option 59: T2.
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    /// Option 82: inserted by relays, echoed verbatim in replies.
    RelayAgentInfo(Vec<u8>),
    /// Preserved for forwarding.
    Unknown(u8, Vec<u8>),
}

fn single_addr(code: OptionCode, data: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().map_err(|_| {
        Error::InvalidPacket(format!("Option {} requires 4 bytes", code as u8))
    })?;
    Ok(Ipv4Addr::from(octets))
}

fn addr_list(code: OptionCode, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::InvalidPacket(format!(
            "Option {} requires a multiple of 4 bytes",
            code as u8
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn seconds(code: OptionCode, data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| {
        Error::InvalidPacket(format!("Option {} requires 4 bytes", code as u8))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

impl DhcpOption {
    /// The RFC 2132 code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Parses one option from its code and payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the payload length does not
    /// fit the option type.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => {
                Ok(Self::SubnetMask(single_addr(OptionCode::SubnetMask, data)?))
            }
            Ok(OptionCode::Router) => Ok(Self::Router(addr_list(OptionCode::Router, data)?)),
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(addr_list(OptionCode::DnsServer, data)?))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::BroadcastAddress) => Ok(Self::BroadcastAddress(single_addr(
                OptionCode::BroadcastAddress,
                data,
            )?)),
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(single_addr(
                OptionCode::RequestedIpAddress,
                data,
            )?)),
            Ok(OptionCode::LeaseTime) => {
                Ok(Self::LeaseTime(seconds(OptionCode::LeaseTime, data)?))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Message type option requires 1 byte".to_string(),
                    ));
                }
                let message_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(message_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(single_addr(
                OptionCode::ServerIdentifier,
                data,
            )?)),
            Ok(OptionCode::ParameterRequestList) => {
                Ok(Self::ParameterRequestList(data.to_vec()))
            }
            Ok(OptionCode::RenewalTime) => {
                Ok(Self::RenewalTime(seconds(OptionCode::RenewalTime, data)?))
            }
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(seconds(
                OptionCode::RebindingTime,
                data,
            )?)),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInfo) => Ok(Self::RelayAgentInfo(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End are markers, not options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// Encodes to wire TLV form (code, length, payload).
    pub fn encode(&self) -> Vec<u8> {
        fn tlv(code: u8, payload: &[u8]) -> Vec<u8> {
            let len = payload.len().min(255);
            let mut out = Vec::with_capacity(2 + len);
            out.push(code);
            out.push(len as u8);
            out.extend_from_slice(&payload[..len]);
            out
        }

        fn addr_payload(addrs: &[Ipv4Addr]) -> Vec<u8> {
            addrs
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(|addr| addr.octets())
                .collect()
        }

        match self {
            Self::SubnetMask(addr) => tlv(OptionCode::SubnetMask as u8, &addr.octets()),
            Self::Router(addrs) => tlv(OptionCode::Router as u8, &addr_payload(addrs)),
            Self::DnsServer(addrs) => tlv(OptionCode::DnsServer as u8, &addr_payload(addrs)),
            Self::DomainName(name) => tlv(OptionCode::DomainName as u8, name.as_bytes()),
            Self::BroadcastAddress(addr) => {
                tlv(OptionCode::BroadcastAddress as u8, &addr.octets())
            }
            Self::RequestedIpAddress(addr) => {
                tlv(OptionCode::RequestedIpAddress as u8, &addr.octets())
            }
            Self::LeaseTime(secs) => tlv(OptionCode::LeaseTime as u8, &secs.to_be_bytes()),
            Self::MessageType(message_type) => {
                tlv(OptionCode::MessageType as u8, &[*message_type as u8])
            }
            Self::ServerIdentifier(addr) => {
                tlv(OptionCode::ServerIdentifier as u8, &addr.octets())
            }
            Self::ParameterRequestList(codes) => {
                tlv(OptionCode::ParameterRequestList as u8, codes)
            }
            Self::RenewalTime(secs) => tlv(OptionCode::RenewalTime as u8, &secs.to_be_bytes()),
            Self::RebindingTime(secs) => {
                tlv(OptionCode::RebindingTime as u8, &secs.to_be_bytes())
            }
            Self::ClientIdentifier(id) => tlv(OptionCode::ClientIdentifier as u8, id),
            Self::RelayAgentInfo(info) => tlv(OptionCode::RelayAgentInfo as u8, info),
            Self::Unknown(code, data) => tlv(*code, data),
        }
    }
}
