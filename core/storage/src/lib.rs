//! Local, per-profile storage for tenantsync.
//!
//! This module provides a synchronous key-value abstraction over different
//! persistent backends (memory, files, SQLite), the tenant-scoped view that
//! feature modules write through, the in-tab event bus with its cross-tab
//! relay, and the stable device identity.
//!
//! # Design Principles
//! - Reads and writes never touch the network
//! - Every write notifies in-tab subscribers directly; other tabs learn about
//!   it through a pluggable [`ChangeNotifier`]
//! - Backends are resolved by name through the [`StoreRegistry`]

pub mod device;
pub mod events;
pub mod local;
pub mod memory;
pub mod notifier;
pub mod provider;
pub mod registry;
pub mod sqlite;
pub mod tenant;

pub use device::DeviceIdentity;
pub use events::{BusEvent, ChangeSource, LocalEventBus, Subscription};
pub use local::FileStore;
pub use memory::MemoryStore;
pub use notifier::{BroadcastNotifier, ChangeNotifier, StorageChange};
pub use provider::KeyValueStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use tenant::{TenantKeyedStore, ACTIVE_THEME_KEY, DEVICE_ID_KEY};
