//! Common utilities and types shared across the tenantsync crates.
//!
//! This module provides the tenant, data type and sync record vocabulary
//! used by the local store, the remote client and the orchestrator.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{next_stamp, DataType, DeviceId, SyncRecord, TenantId};
