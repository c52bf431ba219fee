//! TTL-bounded answer cache with negative caching.
//!
//! Entries are keyed by `(name, type)` and expire lazily on lookup; a
//! periodic sweep run by the server evicts dead entries so the map does
//! not grow without bound.
//! Storage is a [`DashMap`], so concurrent `get`/`put` on different keys
//! never contend on a single lock.
//!
//! Negative answers (NXDOMAIN / no-such-type) are cached too, with their
//! own TTL, and reported distinctly so the resolver can short-circuit
//! without consulting the record store or referral chain.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use crate::dns::record::{normalize_name, RecordType, ResourceRecord};

/// Cache key: normalized query name plus record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: String,
    pub rtype: RecordType,
}

impl QueryKey {
    pub fn new(name: &str, rtype: RecordType) -> Self {
        Self {
            name: normalize_name(name),
            rtype,
        }
    }
}

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Fresh positive answer.
    Hit(Vec<ResourceRecord>),
    /// The name/type is cached as known-absent.
    NegativeHit,
    /// Nothing cached (or the entry expired).
    Miss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    records: Vec<ResourceRecord>,
    negative: bool,
    inserted_at: DateTime<Utc>,
    ttl_seconds: u32,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.inserted_at + TimeDelta::seconds(i64::from(self.ttl_seconds))
    }
}

/// Shared answer cache.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: DashMap<QueryKey, CacheEntry>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes the cache at time `now`. Expired entries are evicted and
    /// reported as [`CacheLookup::Miss`].
    pub fn get(&self, key: &QueryKey, now: DateTime<Utc>) -> CacheLookup {
        let expired = match self.entries.get(key) {
            None => return CacheLookup::Miss,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                return if entry.negative {
                    CacheLookup::NegativeHit
                } else {
                    CacheLookup::Hit(entry.records.clone())
                };
            }
        };

        if expired {
            self.entries.remove(key);
        }
        CacheLookup::Miss
    }

    /// Stores (or overwrites) a positive answer.
    pub fn put(
        &self,
        key: QueryKey,
        records: Vec<ResourceRecord>,
        ttl_seconds: u32,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            key,
            CacheEntry {
                records,
                negative: false,
                inserted_at: now,
                ttl_seconds,
            },
        );
    }

    /// Stores (or overwrites) a negative answer with its own TTL.
    pub fn put_negative(&self, key: QueryKey, ttl_seconds: u32, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            CacheEntry {
                records: Vec::new(),
                negative: true,
                inserted_at: now,
                ttl_seconds,
            },
        );
    }

    /// Evicts every expired entry. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Current entry count, including not-yet-swept expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
