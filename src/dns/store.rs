//! Authoritative record storage with copy-on-write snapshots.
//!
//! Readers load the current [`ZoneSet`] snapshot through an [`ArcSwap`]
//! and never block; a zone reload builds a fresh snapshot and installs it
//! atomically, so in-flight lookups complete against a consistent view.
//! A reload that fails validation leaves the previous snapshot active.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::dns::record::{normalize_name, RecordType, ResourceRecord, Zone};
use crate::error::{Error, Result};

/// Immutable collection of zones, ordered by suffix specificity.
#[derive(Debug, Default)]
pub struct ZoneSet {
    /// Sorted longest-suffix-first so the first owning zone wins.
    zones: Vec<Zone>,
}

impl ZoneSet {
    fn most_specific_owner(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.owns(name))
    }
}

/// Outcome of an authoritative lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The owning zone holds matching records.
    Found(Vec<ResourceRecord>),
    /// The owning zone knows the name only as an alias.
    Alias(ResourceRecord),
    /// The zone owns the name but has no record of this type (or no
    /// record at all). Carries the SOA minimum TTL for negative caching.
    NoSuchRecordType { soa_minimum_ttl: u32 },
    /// No configured zone owns the name.
    NotFound,
}

/// Authoritative zone store.
///
/// Read-mostly; mutated only through [`load_zone`](Self::load_zone) and
/// [`remove_zone`](Self::remove_zone), each of which swaps in a complete
/// new snapshot.
#[derive(Debug, Default)]
pub struct RecordStore {
    snapshot: ArcSwap<ZoneSet>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store preloaded with `zones`, validating each.
    pub fn with_zones(zones: Vec<Zone>) -> Result<Self> {
        let store = Self::new();
        for zone in zones {
            store.load_zone(zone)?;
        }
        Ok(store)
    }

    /// Installs or replaces a zone atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZoneData`] if the zone is malformed (empty apex
    /// name, records outside the zone suffix, or zero SOA minimum TTL).
    /// On error the previous snapshot remains active; partial application
    /// is impossible by construction.
    pub fn load_zone(&self, zone: Zone) -> Result<()> {
        let mut zone = zone;
        zone.name = normalize_name(&zone.name);
        validate_zone(&zone)?;

        let current = self.snapshot.load();
        let mut zones: Vec<Zone> = current
            .zones
            .iter()
            .filter(|existing| existing.name != zone.name)
            .cloned()
            .collect();
        zones.push(zone);
        zones.sort_by(|a, b| b.name.len().cmp(&a.name.len()));

        self.snapshot.store(Arc::new(ZoneSet { zones }));
        Ok(())
    }

    /// Drops a zone from the snapshot. Unknown names are a no-op.
    pub fn remove_zone(&self, name: &str) {
        let name = normalize_name(name);
        let current = self.snapshot.load();
        let zones: Vec<Zone> = current
            .zones
            .iter()
            .filter(|zone| zone.name != name)
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(ZoneSet { zones }));
    }

    /// Looks up `name`/`rtype` in the most specific owning zone.
    ///
    /// A CNAME at the queried name is reported as [`Lookup::Alias`] unless
    /// the query itself asked for CNAME records.
    pub fn lookup(&self, name: &str, rtype: RecordType) -> Lookup {
        let snapshot = self.snapshot.load();
        let Some(zone) = snapshot.most_specific_owner(name) else {
            return Lookup::NotFound;
        };

        let records = zone.records_for(name, rtype);
        if !records.is_empty() {
            return Lookup::Found(records);
        }

        if rtype != RecordType::Cname {
            if let Some(alias) = zone.cname_for(name) {
                return Lookup::Alias(alias);
            }
        }

        Lookup::NoSuchRecordType {
            soa_minimum_ttl: zone.soa.minimum_ttl,
        }
    }

    /// The SOA record of the most specific zone owning `name`, as a
    /// resource record suitable for a negative reply's authority section.
    pub fn authority_soa(&self, name: &str) -> Option<ResourceRecord> {
        let snapshot = self.snapshot.load();
        let zone = snapshot.most_specific_owner(name)?;
        Some(ResourceRecord::new(
            &zone.name,
            zone.soa.minimum_ttl,
            crate::dns::record::RecordData::Soa(zone.soa.clone()),
        ))
    }

    /// Names of all loaded zones, for the administrative surface.
    pub fn zone_names(&self) -> Vec<String> {
        self.snapshot
            .load()
            .zones
            .iter()
            .map(|zone| zone.name.clone())
            .collect()
    }
}

fn validate_zone(zone: &Zone) -> Result<()> {
    if zone.name.is_empty() {
        return Err(Error::ZoneData {
            zone: zone.name.clone(),
            reason: "zone name must not be empty".to_string(),
        });
    }

    if zone.soa.minimum_ttl == 0 {
        return Err(Error::ZoneData {
            zone: zone.name.clone(),
            reason: "SOA minimum TTL must be greater than 0".to_string(),
        });
    }

    for record in &zone.records {
        if !zone.owns(&record.name) {
            return Err(Error::ZoneData {
                zone: zone.name.clone(),
                reason: format!("record {} is outside the zone suffix", record.name),
            });
        }
    }

    Ok(())
}
