//! DNS resource records and authoritative zones.
//!
//! Records are immutable once stored in a zone; a zone is only ever
//! replaced wholesale through [`RecordStore::load_zone`](crate::dns::store::RecordStore::load_zone).

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Record types understood by the resolver.
///
/// The discriminants are the RFC 1035/3596 wire TYPE values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Ns = 2,
    Cname = 5,
    Soa = 6,
    Ptr = 12,
    Mx = 15,
    Txt = 16,
    Aaaa = 28,
}

impl RecordType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for RecordType {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::A),
            2 => Ok(Self::Ns),
            5 => Ok(Self::Cname),
            6 => Ok(Self::Soa),
            12 => Ok(Self::Ptr),
            15 => Ok(Self::Mx),
            16 => Ok(Self::Txt),
            28 => Ok(Self::Aaaa),
            other => Err(other),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "NS" => Ok(Self::Ns),
            "CNAME" => Ok(Self::Cname),
            "SOA" => Ok(Self::Soa),
            "PTR" => Ok(Self::Ptr),
            "MX" => Ok(Self::Mx),
            "TXT" => Ok(Self::Txt),
            "AAAA" => Ok(Self::Aaaa),
            other => Err(format!("unknown record type: {}", other)),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::A => "A",
            Self::Ns => "NS",
            Self::Cname => "CNAME",
            Self::Soa => "SOA",
            Self::Ptr => "PTR",
            Self::Mx => "MX",
            Self::Txt => "TXT",
            Self::Aaaa => "AAAA",
        };
        write!(f, "{}", name)
    }
}

/// The typed payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Alias target; resolution restarts against the target name.
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Txt(String),
    Soa(Soa),
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::A(_) => RecordType::A,
            Self::Aaaa(_) => RecordType::Aaaa,
            Self::Cname(_) => RecordType::Cname,
            Self::Ns(_) => RecordType::Ns,
            Self::Ptr(_) => RecordType::Ptr,
            Self::Mx { .. } => RecordType::Mx,
            Self::Txt(_) => RecordType::Txt,
            Self::Soa(_) => RecordType::Soa,
        }
    }
}

/// Start-of-authority data for a zone.
///
/// `minimum_ttl` doubles as the negative-caching TTL for names the zone
/// owns but has no record of (RFC 2308).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soa {
    pub primary_ns: String,
    pub responsible: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum_ttl: u32,
}

/// A single resource record within a zone or an answer section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Fully qualified owner name, normalized (lowercase, no trailing dot).
    pub name: String,
    pub ttl_seconds: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn new(name: &str, ttl_seconds: u32, data: RecordData) -> Self {
        Self {
            name: normalize_name(name),
            ttl_seconds,
            data,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }
}

/// An authoritative zone: an apex name, its SOA, and its records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// The domain suffix this zone is authoritative for.
    pub name: String,
    pub soa: Soa,
    pub records: Vec<ResourceRecord>,
}

impl Zone {
    /// Returns true if `name` falls under this zone's suffix.
    pub fn owns(&self, name: &str) -> bool {
        let name = normalize_name(name);
        name == self.name || name.ends_with(&format!(".{}", self.name))
    }

    /// All records matching `name` with the given type.
    pub fn records_for(&self, name: &str, rtype: RecordType) -> Vec<ResourceRecord> {
        let name = normalize_name(name);
        self.records
            .iter()
            .filter(|record| record.name == name && record.record_type() == rtype)
            .cloned()
            .collect()
    }

    /// The CNAME record at `name`, if one exists.
    pub fn cname_for(&self, name: &str) -> Option<ResourceRecord> {
        let name = normalize_name(name);
        self.records
            .iter()
            .find(|record| record.name == name && record.record_type() == RecordType::Cname)
            .cloned()
    }

}

/// Normalizes a domain name for comparison: lowercase, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Synthesizes the `in-addr.arpa` name for a reverse (PTR) lookup.
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "{}.{}.{}.{}.in-addr.arpa",
        octets[3], octets[2], octets[1], octets[0]
    )
}
