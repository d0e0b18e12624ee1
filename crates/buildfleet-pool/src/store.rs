//! Slot accounting
//!
//! A [`SlotStore`] owns the leased-slot counters of every remote host. All
//! acquisition and release goes through it, and both happen inside the
//! store's critical section, so no two concurrent acquisitions can push a
//! host above its configured `slots`.

use crate::error::{PoolError, Result};
use crate::host::RemoteHost;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Leased-slot bookkeeping shared by the pool and its leases
pub trait SlotStore: Send + Sync + std::fmt::Debug {
    /// Pick the best candidate with free capacity and record a lease for `prid`
    ///
    /// Returns the index of the chosen host in `hosts`, or `None` when no
    /// enabled host has a free slot.
    fn try_acquire(&self, hosts: &[RemoteHost], prid: &str) -> Result<Option<usize>>;

    /// Remove the lease held by `prid` on `host`
    fn release(&self, host: &RemoteHost, prid: &str) -> Result<()>;

    /// Refresh the timestamp of the lease held by `prid` on `host`
    ///
    /// A renewed lease is not reclaimed by `lease_ttl` until another full
    /// TTL has passed.
    fn renew(&self, host: &RemoteHost, prid: &str) -> Result<()>;

    /// Number of slots currently leased on `host`
    fn leased(&self, host: &RemoteHost) -> Result<u32>;
}

/// One recorded lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub prid: String,
    pub acquired_at: DateTime<Utc>,
}

/// Leases indexed by [`RemoteHost::slot_key`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotLedger {
    pub leases: BTreeMap<String, Vec<LeaseRecord>>,
}

impl SlotLedger {
    pub fn leased(&self, host: &RemoteHost) -> u32 {
        self.leases
            .get(&host.slot_key())
            .map(|records| slot_count(records.len()))
            .unwrap_or(0)
    }

    /// Drop leases older than `ttl` on the given hosts
    ///
    /// Returns the number of reclaimed leases.
    pub fn reclaim_expired(&mut self, hosts: &[RemoteHost], ttl: Duration, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };

        let mut reclaimed = 0;
        for host in hosts {
            let Some(records) = self.leases.get_mut(&host.slot_key()) else {
                continue;
            };
            records.retain(|record| {
                let expired = now.signed_duration_since(record.acquired_at) >= ttl;
                if expired {
                    tracing::warn!(
                        "Reclaiming stale lease on {} held by {} since {}",
                        host.hostname,
                        record.prid,
                        record.acquired_at
                    );
                    reclaimed += 1;
                }
                !expired
            });
        }
        self.leases.retain(|_, records| !records.is_empty());
        reclaimed
    }

    /// Select a host and record the lease
    pub fn acquire(&mut self, hosts: &[RemoteHost], prid: &str, now: DateTime<Utc>) -> Option<usize> {
        let leased: Vec<u32> = hosts.iter().map(|host| self.leased(host)).collect();
        let index = select_host(hosts, &leased)?;

        self.leases
            .entry(hosts[index].slot_key())
            .or_default()
            .push(LeaseRecord {
                prid: prid.to_string(),
                acquired_at: now,
            });
        Some(index)
    }

    pub fn release(&mut self, host: &RemoteHost, prid: &str) -> Result<()> {
        let key = host.slot_key();
        let records = self
            .leases
            .get_mut(&key)
            .ok_or_else(|| not_leased(host, prid))?;
        let position = records
            .iter()
            .position(|record| record.prid == prid)
            .ok_or_else(|| not_leased(host, prid))?;
        records.remove(position);

        if records.is_empty() {
            self.leases.remove(&key);
        }
        Ok(())
    }

    pub fn renew(&mut self, host: &RemoteHost, prid: &str, now: DateTime<Utc>) -> Result<()> {
        let record = self
            .leases
            .get_mut(&host.slot_key())
            .and_then(|records| records.iter_mut().find(|record| record.prid == prid))
            .ok_or_else(|| not_leased(host, prid))?;
        record.acquired_at = now;
        Ok(())
    }
}

/// Lease count as a slot number, saturating at `u32::MAX`
fn slot_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn not_leased(host: &RemoteHost, prid: &str) -> PoolError {
    PoolError::NotLeased {
        host: host.hostname.clone(),
        prid: prid.to_string(),
    }
}

/// Choose the host with the most free slots
///
/// Ties go to the host listed first in the configuration. Disabled and full
/// hosts are skipped.
pub fn select_host(hosts: &[RemoteHost], leased: &[u32]) -> Option<usize> {
    hosts
        .iter()
        .zip(leased)
        .enumerate()
        .filter(|(_, (host, _))| host.enabled)
        .filter_map(|(index, (host, used))| {
            host.slots.checked_sub(*used).filter(|free| *free > 0).map(|free| (index, free))
        })
        .fold(None, |best: Option<(usize, u32)>, (index, free)| match best {
            Some((_, best_free)) if best_free >= free => best,
            _ => Some((index, free)),
        })
        .map(|(index, _)| index)
}

/// In-process slot store
///
/// Suitable when every build task runs inside one process. Use
/// [`MemorySlotStore::global`] so that independently created pools share
/// the same counters.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    ledger: Mutex<SlotLedger>,
    lease_ttl: Option<Duration>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Process-wide store
    pub fn global() -> Arc<MemorySlotStore> {
        static GLOBAL: OnceLock<Arc<MemorySlotStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(MemorySlotStore::new())).clone()
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut SlotLedger) -> Result<T>) -> Result<T> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| PoolError::LockError("slot ledger mutex poisoned".to_string()))?;
        f(&mut ledger)
    }
}

impl SlotStore for MemorySlotStore {
    fn try_acquire(&self, hosts: &[RemoteHost], prid: &str) -> Result<Option<usize>> {
        self.with_ledger(|ledger| {
            let now = Utc::now();
            if let Some(ttl) = self.lease_ttl {
                ledger.reclaim_expired(hosts, ttl, now);
            }
            Ok(ledger.acquire(hosts, prid, now))
        })
    }

    fn release(&self, host: &RemoteHost, prid: &str) -> Result<()> {
        self.with_ledger(|ledger| ledger.release(host, prid))
    }

    fn renew(&self, host: &RemoteHost, prid: &str) -> Result<()> {
        self.with_ledger(|ledger| ledger.renew(host, prid, Utc::now()))
    }

    fn leased(&self, host: &RemoteHost) -> Result<u32> {
        self.with_ledger(|ledger| Ok(ledger.leased(host)))
    }
}
