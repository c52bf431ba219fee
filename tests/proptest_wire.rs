//! Fuzz-style checks that the wire codecs reject garbage without
//! panicking. Hostile datagrams arrive straight off the network, so the
//! parsers must fail through `Result` for any input.

use lanlord::dhcp::packet::{DhcpPacket, DHCP_MAGIC_COOKIE};
use lanlord::dns::wire::{DnsQuery, Header};
use proptest::prelude::*;

proptest! {
    #[test]
    fn dns_parsers_never_panic(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = Header::parse(&data);
        let _ = DnsQuery::parse(&data);
    }

    #[test]
    fn dns_header_requires_twelve_bytes(data in proptest::collection::vec(any::<u8>(), 0..12)) {
        prop_assert!(Header::parse(&data).is_err());
    }

    #[test]
    fn dhcp_parser_never_panics(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn dhcp_rejects_short_packets(data in proptest::collection::vec(any::<u8>(), 0..240)) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    // A valid fixed header followed by arbitrary option bytes: the
    // option walker must stop cleanly at every malformation.
    #[test]
    fn dhcp_option_region_fuzz(options in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut data = vec![0u8; 236];
        data[0] = 1;
        data[1] = 1;
        data[2] = 6;
        data.extend_from_slice(&DHCP_MAGIC_COOKIE);
        data.extend_from_slice(&options);
        let _ = DhcpPacket::parse(&data);
    }

    // Compression pointers in names must not loop the decoder.
    #[test]
    fn dns_pointer_fuzz(offset in 0u16..1024) {
        let mut data = Vec::new();
        data.extend_from_slice(&0x1234u16.to_be_bytes());
        data.extend_from_slice(&0x0100u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 6]);
        data.extend_from_slice(&(0xc000 | (offset & 0x3fff)).to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        let _ = DnsQuery::parse(&data);
    }
}
