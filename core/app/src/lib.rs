//! tenantsync application layer.
//!
//! Wires the profile store, device identity, event bus, remote client and
//! orchestrator into one [`SyncCore`] per tab, configured from a
//! [`CoreConfig`].

pub mod config;
pub mod sync_core;

pub use crate::config::{CoreConfig, RemoteConfig, ScheduleMode, StoreConfig};
pub use crate::sync_core::{SyncCore, SyncCoreBuilder};

pub use tenantsync_common::{DataType, DeviceId, Error, Result, TenantId};
pub use tenantsync_storage::{BusEvent, ChangeSource, Subscription};
pub use tenantsync_sync::{SyncEntry, SyncResult, SyncState, SyncStatus};
