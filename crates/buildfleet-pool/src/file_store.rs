//! File-backed slot store
//!
//! Keeps the slot ledger in `<slots_dir>/slots.json`. Every read-modify-write
//! happens while holding an exclusive lock on `<slots_dir>/slots.lock`, so the
//! counters stay consistent across threads and across OS processes (or
//! machines sharing the directory over a filesystem with working `flock`).

use crate::error::{PoolError, Result};
use crate::host::RemoteHost;
use crate::store::{SlotLedger, SlotStore};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LEDGER_VERSION: u32 = 1;
const LEDGER_FILE: &str = "slots.json";
const LEDGER_TMP: &str = "slots.json.tmp";
const LOCK_FILE: &str = "slots.lock";

/// On-disk ledger document
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    ledger: SlotLedger,
}

#[derive(Debug)]
pub struct FileSlotStore {
    slots_dir: PathBuf,
    lease_ttl: Option<Duration>,
}

impl FileSlotStore {
    pub fn new(slots_dir: impl AsRef<Path>) -> Self {
        Self {
            slots_dir: slots_dir.as_ref().to_path_buf(),
            lease_ttl: None,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn slots_dir(&self) -> &Path {
        &self.slots_dir
    }

    fn ledger_path(&self) -> PathBuf {
        self.slots_dir.join(LEDGER_FILE)
    }

    fn open_lock_file(&self) -> Result<File> {
        if !self.slots_dir.exists() {
            fs::create_dir_all(&self.slots_dir)?;
            tracing::debug!("Created slots directory: {}", self.slots_dir.display());
        }

        let lock_path = self.slots_dir.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| PoolError::LockError(format!("{}: {}", lock_path.display(), e)))
    }

    fn load(&self) -> Result<SlotLedger> {
        let path = self.ledger_path();
        if !path.exists() {
            return Ok(SlotLedger::default());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(SlotLedger::default());
        }

        let file: LedgerFile = serde_json::from_str(&content)?;
        if file.version > LEDGER_VERSION {
            return Err(PoolError::StateError(format!(
                "Slot ledger version {} is newer than supported version {}",
                file.version, LEDGER_VERSION
            )));
        }
        Ok(file.ledger)
    }

    fn save(&self, ledger: SlotLedger) -> Result<()> {
        let file = LedgerFile {
            version: LEDGER_VERSION,
            updated_at: Utc::now(),
            ledger,
        };

        // readers never observe a partially written ledger
        let tmp = self.slots_dir.join(LEDGER_TMP);
        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, self.ledger_path())?;
        Ok(())
    }

    /// Run `f` on the ledger under the exclusive lock and persist the result
    fn update<T>(&self, f: impl FnOnce(&mut SlotLedger) -> Result<T>) -> Result<T> {
        let lock = self.open_lock_file()?;
        FileExt::lock_exclusive(&lock).map_err(|e| PoolError::LockError(e.to_string()))?;

        let result = self.load().and_then(|mut ledger| {
            let value = f(&mut ledger)?;
            self.save(ledger)?;
            Ok(value)
        });

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("Failed to unlock {}: {}", self.slots_dir.display(), e);
        }
        result
    }

    fn read(&self) -> Result<SlotLedger> {
        let lock = self.open_lock_file()?;
        FileExt::lock_shared(&lock).map_err(|e| PoolError::LockError(e.to_string()))?;
        let ledger = self.load();
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("Failed to unlock {}: {}", self.slots_dir.display(), e);
        }
        ledger
    }
}

impl SlotStore for FileSlotStore {
    fn try_acquire(&self, hosts: &[RemoteHost], prid: &str) -> Result<Option<usize>> {
        self.update(|ledger| {
            let now = Utc::now();
            if let Some(ttl) = self.lease_ttl {
                ledger.reclaim_expired(hosts, ttl, now);
            }
            Ok(ledger.acquire(hosts, prid, now))
        })
    }

    fn release(&self, host: &RemoteHost, prid: &str) -> Result<()> {
        self.update(|ledger| ledger.release(host, prid))
    }

    fn renew(&self, host: &RemoteHost, prid: &str) -> Result<()> {
        self.update(|ledger| ledger.renew(host, prid, Utc::now()))
    }

    fn leased(&self, host: &RemoteHost) -> Result<u32> {
        Ok(self.read()?.leased(host))
    }
}
