//! Query resolution: cache, then authoritative data, then referrals.
//!
//! Resolution is a small state machine. Each step consults the answer
//! cache first, then the local authoritative store, then walks the
//! referral table toward upstream servers. A CNAME at any step restarts
//! resolution against the alias target, with the chain accumulated into
//! the final answer and a seen-set guarding against alias cycles.
//!
//! Terminal outcomes are [`Resolution::Answered`], [`Resolution::NxDomain`],
//! and [`Resolution::ServFail`]. The first two are cacheable (positive
//! answers with the smallest record TTL, negative answers with the owning
//! zone's SOA minimum TTL); SERVFAIL is never cached, so a transient
//! failure does not poison later queries.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::dns::cache::{CacheLookup, DnsCache, QueryKey};
use crate::dns::record::{normalize_name, reverse_name, RecordData, RecordType, ResourceRecord};
use crate::dns::store::{Lookup, RecordStore};

/// Default bound on referral hops (and alias-chain length) per query.
pub const DEFAULT_MAX_REFERRAL_DEPTH: usize = 16;

/// Terminal outcome of resolving one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Records answering the question, alias chain included.
    Answered {
        records: Vec<ResourceRecord>,
        /// True when the answer came from local authoritative data rather
        /// than the cache or an upstream.
        authoritative: bool,
    },
    /// The name (or record type) does not exist.
    NxDomain {
        /// SOA of the denying zone, for the reply's authority section.
        /// Absent when the negative answer came from the cache.
        soa: Option<ResourceRecord>,
    },
    /// Resolution could not complete. Never cached.
    ServFail,
}

/// A simulated upstream server reachable through referrals.
///
/// Each upstream carries its own authoritative data and may itself refer
/// onward, so referral chains (and cycles) can be expressed.
#[derive(Debug, Default)]
pub struct Upstream {
    pub store: RecordStore,
    /// Suffix to next-server-name referrals, consulted when this
    /// upstream's store does not own the queried name.
    pub referrals: Vec<Referral>,
}

/// One delegation edge: names under `suffix` belong to `server`.
#[derive(Debug, Clone)]
pub struct Referral {
    pub suffix: String,
    pub server: String,
}

impl Referral {
    pub fn new(suffix: &str, server: &str) -> Self {
        Self {
            suffix: normalize_name(suffix),
            server: server.to_string(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        name == self.suffix || name.ends_with(&format!(".{}", self.suffix))
    }
}

/// Delegation map: entry-point referrals plus the named upstreams they
/// (and each other) point at.
#[derive(Debug, Default)]
pub struct ReferralTable {
    entry_points: Vec<Referral>,
    servers: HashMap<String, Arc<Upstream>>,
}

impl ReferralTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&mut self, name: &str, upstream: Upstream) {
        self.servers.insert(name.to_string(), Arc::new(upstream));
    }

    pub fn add_entry(&mut self, referral: Referral) {
        self.entry_points.push(referral);
        // Longest suffix first so the most specific delegation wins.
        self.entry_points
            .sort_by(|a, b| b.suffix.len().cmp(&a.suffix.len()));
    }

    fn entry_for(&self, name: &str) -> Option<&Referral> {
        self.entry_points.iter().find(|r| r.matches(name))
    }

    fn server(&self, name: &str) -> Option<Arc<Upstream>> {
        self.servers.get(name).cloned()
    }
}

/// The resolver core.
pub struct Resolver {
    store: Arc<RecordStore>,
    cache: Arc<DnsCache>,
    referrals: ReferralTable,
    max_referral_depth: usize,
}

impl Resolver {
    pub fn new(store: Arc<RecordStore>, cache: Arc<DnsCache>) -> Self {
        Self {
            store,
            cache,
            referrals: ReferralTable::new(),
            max_referral_depth: DEFAULT_MAX_REFERRAL_DEPTH,
        }
    }

    pub fn with_referrals(mut self, referrals: ReferralTable) -> Self {
        self.referrals = referrals;
        self
    }

    pub fn with_max_referral_depth(mut self, depth: usize) -> Self {
        self.max_referral_depth = depth;
        self
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    /// Resolves `name`/`rtype` at time `now`.
    ///
    /// Identical back-to-back queries are answered from the cache, so a
    /// second call with the same arguments yields the same records.
    pub fn resolve(&self, name: &str, rtype: RecordType, now: DateTime<Utc>) -> Resolution {
        let mut current = normalize_name(name);
        let mut chain: Vec<ResourceRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            if !seen.insert(current.clone()) {
                warn!(name = %current, "Alias cycle detected");
                return Resolution::ServFail;
            }
            if chain.len() > self.max_referral_depth {
                warn!(name = %current, "Alias chain exceeds depth bound");
                return Resolution::ServFail;
            }

            match self.resolve_step(&current, rtype, now) {
                Step::Records {
                    records,
                    authoritative,
                } => {
                    let mut answer = chain;
                    let authoritative = authoritative && answer.is_empty();
                    answer.extend(records);
                    return Resolution::Answered {
                        records: answer,
                        authoritative,
                    };
                }
                Step::Alias(record) => {
                    let RecordData::Cname(target) = &record.data else {
                        return Resolution::ServFail;
                    };
                    let target = normalize_name(target);
                    debug!(name = %current, target = %target, "Following alias");
                    chain.push(record.clone());
                    current = target;
                }
                Step::Negative { soa } => return Resolution::NxDomain { soa },
                Step::Failed => return Resolution::ServFail,
            }
        }
    }

    /// Resolves a reverse lookup for `ip` as a PTR query.
    pub fn resolve_ptr(&self, ip: Ipv4Addr, now: DateTime<Utc>) -> Resolution {
        self.resolve(&reverse_name(ip), RecordType::Ptr, now)
    }

    /// One hop of the state machine for a single (already normalized) name.
    fn resolve_step(&self, name: &str, rtype: RecordType, now: DateTime<Utc>) -> Step {
        let key = QueryKey::new(name, rtype);
        match self.cache.get(&key, now) {
            CacheLookup::Hit(records) => {
                debug!(name = %name, rtype = %rtype, "Cache hit");
                return Step::Records {
                    records,
                    authoritative: false,
                };
            }
            CacheLookup::NegativeHit => {
                debug!(name = %name, rtype = %rtype, "Negative cache hit");
                return Step::Negative { soa: None };
            }
            CacheLookup::Miss => {}
        }

        match self.store.lookup(name, rtype) {
            Lookup::Found(records) => {
                self.cache_positive(key, &records, now);
                Step::Records {
                    records,
                    authoritative: true,
                }
            }
            Lookup::Alias(record) => Step::Alias(record),
            Lookup::NoSuchRecordType { soa_minimum_ttl } => {
                self.cache.put_negative(key, soa_minimum_ttl, now);
                Step::Negative {
                    soa: self.store.authority_soa(name),
                }
            }
            Lookup::NotFound => self.follow_referrals(name, rtype, key, now),
        }
    }

    /// Walks the delegation chain for a name outside local authority.
    fn follow_referrals(
        &self,
        name: &str,
        rtype: RecordType,
        key: QueryKey,
        now: DateTime<Utc>,
    ) -> Step {
        let Some(entry) = self.referrals.entry_for(name) else {
            debug!(name = %name, "No zone and no referral for name");
            return Step::Failed;
        };

        let mut next_server = entry.server.clone();
        for _depth in 0..self.max_referral_depth {
            let Some(upstream) = self.referrals.server(&next_server) else {
                warn!(server = %next_server, "Referral names an unknown server");
                return Step::Failed;
            };

            match upstream.store.lookup(name, rtype) {
                Lookup::Found(records) => {
                    self.cache_positive(key, &records, now);
                    return Step::Records {
                        records,
                        authoritative: false,
                    };
                }
                Lookup::Alias(record) => return Step::Alias(record),
                Lookup::NoSuchRecordType { soa_minimum_ttl } => {
                    self.cache.put_negative(key, soa_minimum_ttl, now);
                    return Step::Negative {
                        soa: upstream.store.authority_soa(name),
                    };
                }
                Lookup::NotFound => {
                    match upstream.referrals.iter().find(|r| r.matches(name)) {
                        Some(referral) => {
                            debug!(
                                server = %next_server,
                                next = %referral.server,
                                "Following referral"
                            );
                            next_server = referral.server.clone();
                        }
                        None => {
                            debug!(server = %next_server, name = %name, "Dead-end referral");
                            return Step::Failed;
                        }
                    }
                }
            }
        }

        warn!(
            name = %name,
            max_depth = self.max_referral_depth,
            "Referral depth bound exceeded"
        );
        Step::Failed
    }

    fn cache_positive(&self, key: QueryKey, records: &[ResourceRecord], now: DateTime<Utc>) {
        let Some(min_ttl) = records.iter().map(|r| r.ttl_seconds).min() else {
            return;
        };
        if min_ttl == 0 {
            // TTL 0 means do-not-cache.
            return;
        }
        self.cache.put(key, records.to_vec(), min_ttl, now);
    }
}

enum Step {
    Records {
        records: Vec<ResourceRecord>,
        authoritative: bool,
    },
    Alias(ResourceRecord),
    Negative { soa: Option<ResourceRecord> },
    Failed,
}
