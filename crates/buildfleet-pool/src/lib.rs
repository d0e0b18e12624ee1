//! buildfleet remote host pool
//!
//! Leases build slots on remote build hosts. Each host accepts a fixed number
//! of concurrent builds per platform; the pool hands out one slot at a time
//! and the slot counters are shared by every build task that uses the same
//! configuration, whether they run as threads of one process or as separate
//! processes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              BinaryBuildTask                 │
//! └───────────────────┬──────────────────────────┘
//!                     │ lock_resource / unlock
//! ┌───────────────────▼──────────────────────────┐
//! │               ResourcePool                   │
//! │   hosts (platform, config order)             │
//! └───────────────────┬──────────────────────────┘
//!                     │ trait SlotStore
//!         ┌───────────┴────────────┐
//! ┌───────▼────────┐      ┌────────▼────────┐
//! │ FileSlotStore  │      │ MemorySlotStore │
//! │ (flock, JSON)  │      │ (Mutex)         │
//! └────────────────┘      └─────────────────┘
//! ```

pub mod error;
pub mod file_store;
pub mod host;
pub mod pool;
pub mod store;

// Re-exports
pub use error::{PoolError, Result};
pub use file_store::FileSlotStore;
pub use host::RemoteHost;
pub use pool::{LeaseRenewer, LockedResource, ResourcePool};
pub use store::{LeaseRecord, MemorySlotStore, SlotLedger, SlotStore, select_host};
