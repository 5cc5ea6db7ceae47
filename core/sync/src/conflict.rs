//! Conflict detection and resolution.
//!
//! A conflict exists when a data type still has unpushed local changes and
//! the remote record changed underneath it, written by another device.
//! Resolution is whole-payload: one side wins, nothing is merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use tenantsync_common::{DataType, DeviceId, SyncRecord, TenantId};

use crate::state::SyncEntry;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The more recently modified side wins.
    #[default]
    LastWriterWins,
    /// Keep the local payload; it is pushed by the next cycle.
    PreferLocal,
    /// Adopt the remote payload, dropping local changes.
    PreferRemote,
}

/// Information about a detected conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub tenant_id: TenantId,
    pub data_type: DataType,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_updated: DateTime<Utc>,
    pub remote_device: DeviceId,
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn from_entry_and_remote(tenant_id: &TenantId, entry: &SyncEntry, remote: &SyncRecord) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            data_type: entry.data_type,
            local_modified: entry.local_modified,
            remote_updated: remote.last_updated,
            remote_device: remote.device_id.clone(),
            detected_at: Utc::now(),
        }
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep_local"),
            Resolution::TakeRemote => write!(f, "take_remote"),
        }
    }
}

/// Conflict detector and resolver.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Whether `remote` is newer than anything this entry has seen.
    pub fn is_remote_newer(entry: &SyncEntry, remote: &SyncRecord) -> bool {
        entry
            .remote_updated
            .map_or(true, |seen| remote.last_updated > seen)
    }

    /// Detect if local and remote changed independently.
    ///
    /// Records written by this device (any tab of the profile) never
    /// conflict: the profile store already holds the newest local value.
    pub fn detect_conflict(&self, entry: &SyncEntry, remote: &SyncRecord, own_device: &DeviceId) -> bool {
        entry.dirty && Self::is_remote_newer(entry, remote) && remote.device_id != *own_device
    }

    pub fn resolve(&self, conflict: &ConflictInfo) -> Resolution {
        match self.strategy {
            ConflictStrategy::PreferLocal => Resolution::KeepLocal,
            ConflictStrategy::PreferRemote => Resolution::TakeRemote,
            ConflictStrategy::LastWriterWins => match conflict.local_modified {
                Some(local) if local >= conflict.remote_updated => Resolution::KeepLocal,
                _ => Resolution::TakeRemote,
            },
        }
    }
}
