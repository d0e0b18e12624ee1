//! Resource pool and leases
//!
//! ```text
//!   ResourcePool::from_config ──► lock_resource(prid) ──► LockedResource
//!                                        │                     │
//!                                        ▼                     ▼
//!                                    SlotStore ◄──────── unlock() / drop
//!                                        ▲
//!                                        └──── LeaseRenewer::renew()
//! ```

use crate::error::Result;
use crate::file_store::FileSlotStore;
use crate::host::RemoteHost;
use crate::store::{MemorySlotStore, SlotStore};
use buildfleet_config::RemoteHostsConfig;
use std::sync::Arc;

/// Remote hosts serving one platform, backed by a shared slot store
#[derive(Debug, Clone)]
pub struct ResourcePool {
    platform: String,
    hosts: Vec<RemoteHost>,
    store: Arc<dyn SlotStore>,
}

impl ResourcePool {
    /// Build the pool for `platform` from the `remote_hosts` configuration
    ///
    /// Only enabled hosts are kept. With `slots_dir` configured the slot
    /// counters live in a file ledger shared between processes, otherwise in
    /// the process-wide in-memory store.
    pub fn from_config(config: &RemoteHostsConfig, platform: &str) -> Result<Self> {
        let hosts: Vec<RemoteHost> = config
            .hosts_for(platform)?
            .into_iter()
            .filter(|entry| {
                if !entry.enabled {
                    tracing::debug!("Skipping disabled host {} ({})", entry.hostname, platform);
                }
                entry.enabled
            })
            .map(|entry| RemoteHost::from_entry(entry, platform))
            .collect();

        let store: Arc<dyn SlotStore> = match &config.slots_dir {
            Some(dir) => Arc::new(FileSlotStore::new(dir).with_lease_ttl(config.lease_ttl())),
            None => {
                if config.lease_ttl.is_some() {
                    tracing::warn!("lease_ttl is ignored without slots_dir");
                }
                MemorySlotStore::global()
            }
        };

        Ok(Self::with_store(platform, hosts, store))
    }

    pub fn with_store(
        platform: impl Into<String>,
        hosts: Vec<RemoteHost>,
        store: Arc<dyn SlotStore>,
    ) -> Self {
        Self {
            platform: platform.into(),
            hosts,
            store,
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn hosts(&self) -> &[RemoteHost] {
        &self.hosts
    }

    /// Lease one build slot for `prid`
    ///
    /// `Ok(None)` means no host currently has a free slot (or the platform
    /// has no enabled host). That is not an error; the caller decides what
    /// to do about it.
    pub fn lock_resource(&self, prid: &str) -> Result<Option<LockedResource>> {
        let Some(index) = self.store.try_acquire(&self.hosts, prid)? else {
            tracing::warn!(
                "No free build slot for platform {} ({} hosts configured)",
                self.platform,
                self.hosts.len()
            );
            return Ok(None);
        };

        let host = self.hosts[index].clone();
        tracing::info!(
            "Locked a build slot on {} for {} (platform {})",
            host.hostname,
            prid,
            self.platform
        );

        Ok(Some(LockedResource {
            host,
            prid: prid.to_string(),
            store: Arc::clone(&self.store),
            released: false,
        }))
    }

    /// Release a lease obtained from [`ResourcePool::lock_resource`]
    pub fn unlock_resource(&self, locked: LockedResource) -> Result<()> {
        locked.unlock()
    }

    /// Current leased count per host, in configuration order
    pub fn leased_counts(&self) -> Result<Vec<(String, u32)>> {
        self.hosts
            .iter()
            .map(|host| Ok((host.hostname.clone(), self.store.leased(host)?)))
            .collect()
    }
}

/// A leased build slot
///
/// Release it with [`LockedResource::unlock`]. A lease dropped without
/// being unlocked is released on drop with a warning, so early returns and
/// panics never leak a slot. Inside a tokio runtime that release runs on the
/// blocking pool, since a file-backed store waits on `flock`.
#[derive(Debug)]
pub struct LockedResource {
    host: RemoteHost,
    prid: String,
    store: Arc<dyn SlotStore>,
    released: bool,
}

impl LockedResource {
    pub fn host(&self) -> &RemoteHost {
        &self.host
    }

    pub fn platform(&self) -> &str {
        &self.host.platform
    }

    pub fn prid(&self) -> &str {
        &self.prid
    }

    /// Handle that keeps this lease from being reclaimed as stale
    pub fn renewer(&self) -> LeaseRenewer {
        LeaseRenewer {
            host: self.host.clone(),
            prid: self.prid.clone(),
            store: Arc::clone(&self.store),
        }
    }

    /// Release the slot
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.store.release(&self.host, &self.prid)?;
        tracing::info!("Released build slot on {} for {}", self.host.hostname, self.prid);
        Ok(())
    }
}

impl Drop for LockedResource {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(
            "Build slot on {} for {} was not unlocked explicitly, releasing",
            self.host.hostname,
            self.prid
        );
        let store = Arc::clone(&self.store);
        let host = self.host.clone();
        let prid = std::mem::take(&mut self.prid);
        let release = move || {
            if let Err(e) = store.release(&host, &prid) {
                tracing::error!("Failed to release build slot on {}: {}", host.hostname, e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

/// Refreshes the timestamp of a held lease
///
/// Cloneable and `Send`, so a heartbeat task can hold it while the
/// [`LockedResource`] itself stays with the build.
#[derive(Debug, Clone)]
pub struct LeaseRenewer {
    host: RemoteHost,
    prid: String,
    store: Arc<dyn SlotStore>,
}

impl LeaseRenewer {
    pub fn renew(&self) -> Result<()> {
        self.store.renew(&self.host, &self.prid)?;
        tracing::debug!("Renewed build slot lease on {} for {}", self.host.hostname, self.prid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::store::tests::host;

    fn pool(hosts: Vec<RemoteHost>) -> (ResourcePool, Arc<MemorySlotStore>) {
        let store = Arc::new(MemorySlotStore::new());
        (
            ResourcePool::with_store("x86_64", hosts, store.clone()),
            store,
        )
    }

    #[test]
    fn test_lock_then_unlock_restores_counts() {
        let (pool, _) = pool(vec![host("a", 2), host("b", 2)]);
        let first = pool.lock_resource("run-0").unwrap().unwrap();
        let before = pool.leased_counts().unwrap();

        let locked = pool.lock_resource("run-1").unwrap().unwrap();
        assert_ne!(pool.leased_counts().unwrap(), before);
        pool.unlock_resource(locked).unwrap();

        assert_eq!(pool.leased_counts().unwrap(), before);
        first.unlock().unwrap();
    }

    #[test]
    fn test_lease_carries_prid_and_platform() {
        let (pool, _) = pool(vec![host("a", 1)]);
        let locked = pool.lock_resource("pipeline-run-42").unwrap().unwrap();

        assert_eq!(locked.prid(), "pipeline-run-42");
        assert_eq!(locked.platform(), "x86_64");
        assert_eq!(locked.host().hostname, "a");
        locked.unlock().unwrap();
    }

    #[test]
    fn test_spreads_load_across_hosts() {
        let (pool, _) = pool(vec![host("a", 2), host("b", 2)]);

        let first = pool.lock_resource("run-1").unwrap().unwrap();
        let second = pool.lock_resource("run-2").unwrap().unwrap();
        assert_eq!(first.host().hostname, "a");
        assert_eq!(second.host().hostname, "b");

        first.unlock().unwrap();
        second.unlock().unwrap();
    }

    #[test]
    fn test_empty_pool_returns_none() {
        let (pool, _) = pool(Vec::new());
        assert!(pool.lock_resource("run-1").unwrap().is_none());
    }

    #[test]
    fn test_full_pool_returns_none() {
        let (pool, _) = pool(vec![host("a", 1)]);
        let locked = pool.lock_resource("run-1").unwrap().unwrap();

        assert!(pool.lock_resource("run-2").unwrap().is_none());
        locked.unlock().unwrap();
        assert!(pool.lock_resource("run-2").unwrap().is_some());
    }

    #[test]
    fn test_drop_releases_slot() {
        let (pool, store) = pool(vec![host("a", 1)]);
        {
            let _locked = pool.lock_resource("run-1").unwrap().unwrap();
            assert_eq!(store.leased(&pool.hosts()[0]).unwrap(), 1);
        }
        assert_eq!(store.leased(&pool.hosts()[0]).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_inside_runtime_releases_on_blocking_pool() {
        let (pool, store) = pool(vec![host("a", 1)]);
        drop(pool.lock_resource("run-1").unwrap().unwrap());

        for _ in 0..100 {
            if store.leased(&pool.hosts()[0]).unwrap() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.leased(&pool.hosts()[0]).unwrap(), 0);
    }

    #[test]
    fn test_renewer_refreshes_held_lease() {
        let (pool, store) = pool(vec![host("a", 1)]);
        let locked = pool.lock_resource("run-1").unwrap().unwrap();
        let renewer = locked.renewer();

        renewer.renew().unwrap();
        assert_eq!(store.leased(&pool.hosts()[0]).unwrap(), 1);

        locked.unlock().unwrap();
        assert!(matches!(renewer.renew(), Err(PoolError::NotLeased { .. })));
    }

    #[test]
    fn test_unlock_releases_exactly_once() {
        let (pool, store) = pool(vec![host("a", 1)]);
        let locked = pool.lock_resource("run-1").unwrap().unwrap();
        locked.unlock().unwrap();

        // the drop after unlock must not release a second time
        assert!(matches!(
            store.release(&pool.hosts()[0], "run-1"),
            Err(PoolError::NotLeased { .. })
        ));
    }

    #[test]
    fn test_from_config_filters_disabled_hosts() {
        let config: RemoteHostsConfig = serde_yaml::from_str(
            r#"
pools:
  x86_64:
    host-off:
      enabled: false
      auth: /secrets/id_rsa
      username: podman-user
      slots: 5
      socket_path: /run/podman.sock
    host-on:
      auth: /secrets/id_rsa
      username: podman-user
      slots: 1
      socket_path: /run/podman.sock
"#,
        )
        .unwrap();

        let pool = ResourcePool::from_config(&config, "x86_64").unwrap();
        let names: Vec<&str> = pool.hosts().iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["host-on"]);
        assert_eq!(pool.hosts()[0].platform, "x86_64");
    }

    #[test]
    fn test_from_config_malformed() {
        let config: RemoteHostsConfig = serde_yaml::from_str(
            r#"
pools:
  x86_64:
    broken:
      username: podman-user
"#,
        )
        .unwrap();

        assert!(matches!(
            ResourcePool::from_config(&config, "x86_64"),
            Err(PoolError::Config(_))
        ));
    }
}
