//! Lease pool: address allocation and lease lifecycle.
//!
//! Allocation preference is reservation, then the client's requested
//! address, then the lowest free address. The free list is a [`BTreeSet`]
//! so the lowest-free choice is deterministic and released addresses are
//! offered again in order.
//!
//! A lease moves OFFERED -> BOUND on commit, and from either state to a
//! terminal RELEASED or EXPIRED. Terminal addresses rejoin the free list
//! once their reuse grace window has passed (immediately with the default
//! zero-second grace). Offers that are never committed are reclaimed by
//! the periodic sweep after the offer timeout.
//!
//! All state sits behind one async mutex, so a commit observes any
//! earlier commit in full: when two transactions race for the same
//! address, the first to commit wins and the second gets
//! [`Error::Conflict`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dhcp::MacAddr;
use crate::error::{Error, Result};

/// Seconds an uncommitted offer is held before the sweep reclaims it.
pub const DEFAULT_OFFER_TIMEOUT_SECONDS: u32 = 60;

/// Pool parameters, derived from the server configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    /// In-range addresses that must never be handed out.
    pub excluded: HashSet<Ipv4Addr>,
    /// Fixed MAC-to-address assignments; these outrank every other
    /// allocation preference.
    pub reservations: HashMap<MacAddr, Ipv4Addr>,
    pub lease_duration_seconds: u32,
    pub offer_timeout_seconds: u32,
    /// Seconds a released or expired address stays out of circulation.
    pub reuse_grace_seconds: u32,
}

/// Lifecycle state of a lease record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Offered,
    Bound,
    Released,
    Expired,
}

impl LeaseState {
    /// Active states hold their address against other clients.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Offered | Self::Bound)
    }
}

/// One lease record, active or terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub state: LeaseState,
    /// Transaction id of the exchange that produced the current state.
    pub xid: u32,
    pub offered_at: DateTime<Utc>,
    /// Offer timeout while OFFERED, lease end while BOUND.
    pub expires_at: DateTime<Utc>,
    /// When a terminal lease's address may rejoin the free list.
    pub reusable_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Counters from one [`LeasePool::expire_sweep`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Offers that timed out without a commit.
    pub offers_reclaimed: usize,
    /// Bound leases that ran past their duration.
    pub leases_expired: usize,
    /// Addresses returned to the free list.
    pub addresses_reclaimed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.offers_reclaimed + self.leases_expired + self.addresses_reclaimed
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Lease per address; terminal records linger until reclaimed.
    leases: HashMap<Ipv4Addr, Lease>,
    /// Active lease address per client.
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    free: BTreeSet<Ipv4Addr>,
    /// Addresses a client declined; never reallocated automatically.
    quarantined: HashSet<Ipv4Addr>,
}

/// The address pool and lease table.
pub struct LeasePool {
    settings: PoolSettings,
    state: Mutex<PoolState>,
    persist_path: Option<PathBuf>,
}

impl LeasePool {
    pub fn new(settings: PoolSettings) -> Self {
        let reserved: HashSet<Ipv4Addr> = settings.reservations.values().copied().collect();
        let mut free = BTreeSet::new();
        for addr in u32::from(settings.range_start)..=u32::from(settings.range_end) {
            let ip = Ipv4Addr::from(addr);
            if !settings.excluded.contains(&ip) && !reserved.contains(&ip) {
                free.insert(ip);
            }
        }

        Self {
            settings,
            state: Mutex::new(PoolState {
                free,
                ..PoolState::default()
            }),
            persist_path: None,
        }
    }

    /// Persists lease records to `path` after every mutation, and
    /// restores surviving records from it now.
    pub fn with_persistence(mut self, path: PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let records: Vec<Lease> = serde_json::from_str(&content)?;
            let state = self.state.get_mut();
            for lease in records {
                if !lease.state.is_active() {
                    continue;
                }
                state.free.remove(&lease.ip);
                state.by_mac.insert(lease.mac, lease.ip);
                state.leases.insert(lease.ip, lease);
            }
            info!("Restored {} active lease(s) from {}", state.leases.len(), path.display());
        }
        self.persist_path = Some(path);
        Ok(self)
    }

    pub fn lease_duration_seconds(&self) -> u32 {
        self.settings.lease_duration_seconds
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.settings.range_start) && addr <= u32::from(self.settings.range_end)
    }

    /// Offers an address to `mac`, honoring reservation, then the
    /// client's requested address, then the lowest free address.
    ///
    /// A client that already holds an active lease is offered the same
    /// address again.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when no address can be offered, or
    /// [`Error::Conflict`] when the client's reserved address is actively
    /// held by someone else.
    pub async fn offer(
        &self,
        mac: MacAddr,
        requested: Option<Ipv4Addr>,
        xid: u32,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut state = self.state.lock().await;

        if let Some(&reserved) = self.settings.reservations.get(&mac) {
            if let Some(existing) = state.leases.get(&reserved) {
                if existing.state.is_active() && existing.mac != mac {
                    warn!("Reserved address {} is held by {}", reserved, existing.mac);
                    return Err(Error::Conflict(reserved));
                }
            }
            // A client moving onto a reservation may still hold an active
            // lease on a dynamic address, restored from the lease file.
            // Retire it so the client never holds two addresses at once.
            if let Some(&held) = state.by_mac.get(&mac) {
                if held != reserved {
                    info!(
                        "Releasing {} held by {} in favor of reservation {}",
                        held, mac, reserved
                    );
                    self.retire(&mut state, mac, held, LeaseState::Released, now)?;
                }
            }
            let lease = self.place_offer(&mut state, mac, reserved, xid, now);
            self.persist(&state)?;
            return Ok(lease);
        }

        if let Some(&held) = state.by_mac.get(&mac) {
            if let Some(existing) = state.leases.get(&held) {
                if existing.state == LeaseState::Bound {
                    return Ok(existing.clone());
                }
            }
            let lease = self.place_offer(&mut state, mac, held, xid, now);
            self.persist(&state)?;
            return Ok(lease);
        }

        let ip = match requested {
            Some(requested)
                if self.in_range(requested)
                    && state.free.remove(&requested) =>
            {
                requested
            }
            _ => state
                .free
                .pop_first()
                .ok_or(Error::PoolExhausted)?,
        };

        let lease = self.place_offer(&mut state, mac, ip, xid, now);
        self.persist(&state)?;
        Ok(lease)
    }

    fn place_offer(
        &self,
        state: &mut PoolState,
        mac: MacAddr,
        ip: Ipv4Addr,
        xid: u32,
        now: DateTime<Utc>,
    ) -> Lease {
        state.free.remove(&ip);
        let lease = Lease {
            ip,
            mac,
            state: LeaseState::Offered,
            xid,
            offered_at: now,
            expires_at: now + TimeDelta::seconds(i64::from(self.settings.offer_timeout_seconds)),
            reusable_at: None,
        };
        state.by_mac.insert(mac, ip);
        state.leases.insert(ip, lease.clone());
        lease
    }

    /// Commits an offered address, binding the lease.
    ///
    /// A commit against an already-bound lease of the same client
    /// extends it (a REQUEST retransmission or renewal).
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] when another client's active lease holds the
    /// address (that client committed first), [`Error::LeaseNotFound`]
    /// when no live offer or binding exists, including offers that
    /// already timed out.
    pub async fn commit(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        xid: u32,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        if !self.in_range(ip) && self.settings.reservations.get(&mac) != Some(&ip) {
            return Err(Error::AddressOutOfRange(ip));
        }

        let mut state = self.state.lock().await;

        let Some(lease) = state.leases.get_mut(&ip) else {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        };
        if !lease.state.is_active() {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        }
        if lease.mac != mac {
            return Err(Error::Conflict(ip));
        }
        if lease.state == LeaseState::Offered {
            if lease.expires_at <= now {
                // The offer timed out; the sweep will reclaim the address.
                return Err(Error::LeaseNotFound(format!(
                    "offer for {} expired before commit",
                    ip
                )));
            }
            if lease.xid != xid {
                return Err(Error::LeaseNotFound(format!(
                    "offer for {} belongs to another transaction",
                    ip
                )));
            }
        }

        lease.state = LeaseState::Bound;
        lease.xid = xid;
        lease.expires_at =
            now + TimeDelta::seconds(i64::from(self.settings.lease_duration_seconds));
        let committed = lease.clone();

        self.persist(&state)?;
        Ok(committed)
    }

    /// Extends a bound lease for another full duration.
    ///
    /// # Errors
    ///
    /// [`Error::LeaseNotFound`] when the client holds no live binding for
    /// the address.
    pub async fn renew(&self, mac: MacAddr, ip: Ipv4Addr, now: DateTime<Utc>) -> Result<Lease> {
        let mut state = self.state.lock().await;

        let Some(lease) = state.leases.get_mut(&ip) else {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        };
        if lease.state != LeaseState::Bound || lease.mac != mac || lease.expires_at <= now {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        }

        lease.expires_at =
            now + TimeDelta::seconds(i64::from(self.settings.lease_duration_seconds));
        let renewed = lease.clone();

        self.persist(&state)?;
        Ok(renewed)
    }

    /// Releases the client's lease on `ip`.
    pub async fn release(&self, mac: MacAddr, ip: Ipv4Addr, now: DateTime<Utc>) -> Result<Lease> {
        let mut state = self.state.lock().await;
        let released = self.retire(&mut state, mac, ip, LeaseState::Released, now)?;
        self.persist(&state)?;
        Ok(released)
    }

    /// Quarantines an address the client reports as in use elsewhere.
    /// The address never rejoins the free list automatically.
    pub async fn decline(&self, mac: MacAddr, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock().await;

        match state.leases.get(&ip) {
            Some(lease) if lease.state.is_active() && lease.mac == mac => {}
            _ => return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac))),
        }

        state.leases.remove(&ip);
        state.by_mac.remove(&mac);
        state.free.remove(&ip);
        state.quarantined.insert(ip);
        warn!("Address {} quarantined after DECLINE from {}", ip, mac);

        self.persist(&state)?;
        Ok(())
    }

    fn retire(
        &self,
        state: &mut PoolState,
        mac: MacAddr,
        ip: Ipv4Addr,
        terminal: LeaseState,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let Some(lease) = state.leases.get_mut(&ip) else {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        };
        if !lease.state.is_active() || lease.mac != mac {
            return Err(Error::LeaseNotFound(format!("{} for {}", ip, mac)));
        }

        lease.state = terminal;
        let grace = TimeDelta::seconds(i64::from(self.settings.reuse_grace_seconds));
        lease.reusable_at = Some(now + grace);
        let retired = lease.clone();

        state.by_mac.remove(&mac);
        if self.settings.reuse_grace_seconds == 0 && self.allocatable(ip) {
            state.leases.remove(&ip);
            state.free.insert(ip);
        }
        Ok(retired)
    }

    /// True when `ip` may sit on the free list.
    fn allocatable(&self, ip: Ipv4Addr) -> bool {
        self.in_range(ip)
            && !self.settings.excluded.contains(&ip)
            && !self.settings.reservations.values().any(|&r| r == ip)
    }

    /// Reclaims timed-out offers, expires overdue bindings, and returns
    /// grace-elapsed addresses to the free list.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut state = self.state.lock().await;
        let mut report = SweepReport::default();
        let grace = TimeDelta::seconds(i64::from(self.settings.reuse_grace_seconds));

        let mut retired_macs = Vec::new();
        for lease in state.leases.values_mut() {
            if lease.expires_at > now {
                continue;
            }
            match lease.state {
                LeaseState::Offered => {
                    info!("Reclaiming timed-out offer {} for {}", lease.ip, lease.mac);
                    report.offers_reclaimed += 1;
                }
                LeaseState::Bound => {
                    info!("Lease {} for {} expired", lease.ip, lease.mac);
                    report.leases_expired += 1;
                }
                LeaseState::Released | LeaseState::Expired => continue,
            }
            lease.state = LeaseState::Expired;
            lease.reusable_at = Some(now + grace);
            retired_macs.push(lease.mac);
        }
        for mac in retired_macs {
            state.by_mac.remove(&mac);
        }

        let reclaimable: Vec<Ipv4Addr> = state
            .leases
            .values()
            .filter(|lease| {
                !lease.state.is_active()
                    && lease.reusable_at.is_some_and(|at| at <= now)
            })
            .map(|lease| lease.ip)
            .collect();
        for ip in reclaimable {
            state.leases.remove(&ip);
            if self.allocatable(ip) && state.free.insert(ip) {
                report.addresses_reclaimed += 1;
            }
        }

        if report.total() > 0 {
            self.persist(&state)?;
        }
        Ok(report)
    }

    /// All current lease records, active and not-yet-reclaimed terminal.
    pub async fn leases(&self) -> Vec<Lease> {
        let state = self.state.lock().await;
        let mut records: Vec<Lease> = state.leases.values().cloned().collect();
        records.sort_by_key(|lease| u32::from(lease.ip));
        records
    }

    /// The client's active lease, if any.
    pub async fn lease_for(&self, mac: MacAddr) -> Option<Lease> {
        let state = self.state.lock().await;
        let ip = state.by_mac.get(&mac)?;
        state.leases.get(ip).cloned()
    }

    pub async fn free_count(&self) -> usize {
        self.state.lock().await.free.len()
    }

    fn persist(&self, state: &PoolState) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let records: Vec<&Lease> = state.leases.values().collect();
        let content = serde_json::to_string_pretty(&records)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
