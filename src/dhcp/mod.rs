//! DHCP lease engine: wire codec, lease pool, DORA state machine, relay.

pub mod engine;
pub mod options;
pub mod packet;
pub mod pool;
pub mod relay;
pub mod server;

use serde::{Deserialize, Serialize};

/// An Ethernet hardware address.
///
/// Clients are keyed by MAC throughout the lease engine. Serialized as
/// the usual colon-separated hex form so config files and lease files
/// stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Builds a MAC from the leading bytes of a chaddr field.
    ///
    /// Returns `None` unless at least 6 bytes are present.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::str::FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| format!("invalid MAC address: {}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address: {}", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid MAC address: {}", s));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!("aa:bb:cc:dd:ee:ff".parse::<MacAddr>().unwrap(), mac);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_mac_parse_rejects_bad_input() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_from_bytes() {
        let chaddr = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mac = MacAddr::from_bytes(&chaddr).unwrap();
        assert_eq!(mac.octets(), [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert!(MacAddr::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_mac_json_roundtrip() {
        let mac = MacAddr::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"de:ad:be:ef:00:01\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
