//! Server configuration: one JSON file covering both the resolver and
//! the lease engine.
//!
//! A missing config file is created with defaults on first run, so the
//! server comes up answering for `example.test` and leasing out of
//! 192.168.1.0/24 without any hand-editing.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dhcp::engine::EngineSettings;
use crate::dhcp::pool::{PoolSettings, DEFAULT_OFFER_TIMEOUT_SECONDS};
use crate::dhcp::MacAddr;
use crate::dns::record::{RecordData, ResourceRecord, Soa, Zone};
use crate::dns::resolver::{Referral, ReferralTable, Upstream, DEFAULT_MAX_REFERRAL_DEPTH};
use crate::dns::store::RecordStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dns: DnsConfig,
    pub dhcp: DhcpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub bind_ip: Ipv4Addr,
    pub port: u16,
    pub max_referral_depth: usize,
    /// Zones this server answers for authoritatively.
    pub zones: Vec<Zone>,
    /// Delegations for names outside the local zones.
    pub referrals: Vec<ReferralConfig>,
    /// Upstream servers the referrals point at.
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    pub suffix: String,
    pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub referrals: Vec<ReferralConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub bind_ip: Ipv4Addr,
    /// Identifies this server in Option 54 and anchors broadcast math.
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub excluded: Vec<Ipv4Addr>,
    /// Fixed MAC-to-address assignments.
    pub reservations: HashMap<MacAddr, Ipv4Addr>,
    pub lease_duration_seconds: u32,
    pub offer_timeout_seconds: u32,
    pub reuse_grace_seconds: u32,
    /// Lease records survive restarts when set.
    pub lease_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns: DnsConfig::default(),
            dhcp: DhcpConfig::default(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: crate::dns::server::DNS_PORT,
            max_referral_depth: DEFAULT_MAX_REFERRAL_DEPTH,
            zones: vec![default_zone()],
            referrals: Vec::new(),
            upstreams: Vec::new(),
        }
    }
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            dns_servers: vec![Ipv4Addr::new(192, 168, 1, 1)],
            domain_name: Some("example.test".to_string()),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            excluded: Vec::new(),
            reservations: HashMap::new(),
            lease_duration_seconds: 86400,
            offer_timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECONDS,
            reuse_grace_seconds: 0,
            lease_file: Some(PathBuf::from("leases.json")),
        }
    }
}

fn default_zone() -> Zone {
    Zone {
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
        records: vec![
            ResourceRecord::new(
                "ns1.example.test",
                3600,
                RecordData::A(Ipv4Addr::new(192, 168, 1, 1)),
            ),
            ResourceRecord::new(
                "example.test",
                300,
                RecordData::A(Ipv4Addr::new(192, 168, 1, 1)),
            ),
            ResourceRecord::new(
                "www.example.test",
                300,
                RecordData::Cname("example.test".to_string()),
            ),
        ],
    }
}

impl Config {
    /// Loads the config from `path`, writing defaults there first when
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            config.validate()?;
            Ok(config)
        } else {
            info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let dhcp = &self.dhcp;

        if u32::from(dhcp.range_start) > u32::from(dhcp.range_end) {
            return Err(Error::InvalidConfig(format!(
                "range_start {} is above range_end {}",
                dhcp.range_start, dhcp.range_end
            )));
        }

        let mask = u32::from(dhcp.subnet_mask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(Error::InvalidConfig(format!(
                "subnet mask {} is not contiguous",
                dhcp.subnet_mask
            )));
        }

        let in_pool = |ip: Ipv4Addr| {
            u32::from(ip) >= u32::from(dhcp.range_start)
                && u32::from(ip) <= u32::from(dhcp.range_end)
        };
        if in_pool(dhcp.server_ip) {
            return Err(Error::InvalidConfig(format!(
                "server address {} sits inside the pool range",
                dhcp.server_ip
            )));
        }

        for (mac, &ip) in &dhcp.reservations {
            if !in_pool(ip) {
                return Err(Error::InvalidConfig(format!(
                    "reservation {} for {} is outside the pool range",
                    ip, mac
                )));
            }
            if dhcp.excluded.contains(&ip) {
                return Err(Error::InvalidConfig(format!(
                    "reservation {} for {} is also excluded",
                    ip, mac
                )));
            }
        }

        if dhcp.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }
        if dhcp.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.dns.max_referral_depth == 0 {
            return Err(Error::InvalidConfig(
                "max_referral_depth must be greater than 0".to_string(),
            ));
        }
        for referral in &self.dns.referrals {
            if !self
                .dns
                .upstreams
                .iter()
                .any(|upstream| upstream.name == referral.server)
            {
                return Err(Error::InvalidConfig(format!(
                    "referral for {} names unknown server {}",
                    referral.suffix, referral.server
                )));
            }
        }

        Ok(())
    }
}

impl DnsConfig {
    /// Builds the authoritative store from the configured zones.
    pub fn record_store(&self) -> Result<RecordStore> {
        RecordStore::with_zones(self.zones.clone())
    }

    /// Builds the delegation table from configured upstreams.
    pub fn referral_table(&self) -> Result<ReferralTable> {
        let mut table = ReferralTable::new();
        for upstream in &self.upstreams {
            let mut server = Upstream {
                store: RecordStore::with_zones(upstream.zones.clone())?,
                referrals: Vec::new(),
            };
            for referral in &upstream.referrals {
                server
                    .referrals
                    .push(Referral::new(&referral.suffix, &referral.server));
            }
            table.add_server(&upstream.name, server);
        }
        for referral in &self.referrals {
            table.add_entry(Referral::new(&referral.suffix, &referral.server));
        }
        Ok(table)
    }
}

impl DhcpConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            range_start: self.range_start,
            range_end: self.range_end,
            excluded: self.excluded.iter().copied().collect::<HashSet<_>>(),
            reservations: self.reservations.clone(),
            lease_duration_seconds: self.lease_duration_seconds,
            offer_timeout_seconds: self.offer_timeout_seconds,
            reuse_grace_seconds: self.reuse_grace_seconds,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            server_ip: self.server_ip,
            subnet_mask: self.subnet_mask,
            gateway: self.gateway,
            dns_servers: self.dns_servers.clone(),
            domain_name: self.domain_name.clone(),
        }
    }
}
