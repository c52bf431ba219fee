//! Combined DNS resolver and DHCP lease engine for small networks.
//!
//! One process answers name queries for locally configured zones (with
//! TTL-aware positive and negative caching and in-process referral
//! walking) and hands out addresses over DHCP (DORA, renewals, relayed
//! subnets, lease persistence). The two halves share a configuration
//! file and are wired together in the binary; each is usable on its own
//! through [`dns`] and [`dhcp`].

pub mod config;
pub mod dhcp;
pub mod dns;
pub mod error;

pub use config::{Config, DhcpConfig, DnsConfig};
pub use error::{Error, Result};
