//! Remote build host descriptor

use buildfleet_config::RemoteHostEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One remote build machine serving a single platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    pub hostname: String,
    pub username: String,
    pub ssh_keyfile: PathBuf,
    pub socket_path: PathBuf,

    /// Maximum number of concurrent builds on this host for `platform`
    pub slots: u32,

    /// Disabled hosts are never selected
    pub enabled: bool,

    pub platform: String,
}

impl RemoteHost {
    pub fn from_entry(entry: RemoteHostEntry, platform: impl Into<String>) -> Self {
        Self {
            hostname: entry.hostname,
            username: entry.username,
            ssh_keyfile: entry.ssh_keyfile,
            socket_path: entry.socket_path,
            slots: entry.slots,
            enabled: entry.enabled,
            platform: platform.into(),
        }
    }

    /// Ledger key (platform:hostname); slots are counted per platform
    pub fn slot_key(&self) -> String {
        format!("{}:{}", self.platform, self.hostname)
    }

    /// SSH destination used by remote engines
    pub fn ssh_url(&self) -> String {
        format!("ssh://{}@{}", self.username, self.hostname)
    }
}
