//! Per-data-type sync status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tenantsync_common::{DataType, Error, Result};

/// Sync status for a single data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Never touched in this process.
    Idle,
    /// Local changes waiting for a push.
    Pending,
    /// A cycle is working on this type.
    Syncing,
    /// In step with the remote as of the last cycle.
    Synced,
    /// Last attempt failed.
    Error,
}

/// The part of a [`SyncEntry`] that outlives the process.
///
/// Kept in the profile store so an unpushed write is still known to be
/// unpushed after a reload or a tenant switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncMarker {
    pub dirty: bool,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_updated: Option<DateTime<Utc>>,
}

/// Tracking record for one data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub data_type: DataType,
    pub status: SyncStatus,
    /// Local payload changed since the last successful push.
    pub dirty: bool,
    /// Bumped on every local write; a push only clears `dirty` if it is
    /// unchanged when the push completes.
    pub generation: u64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Whether the last failure will be retried by the next cycle.
    pub retryable: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub local_modified: Option<DateTime<Utc>>,
    /// `last_updated` of the newest remote record seen.
    pub remote_updated: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

impl SyncEntry {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            status: SyncStatus::Idle,
            dirty: false,
            generation: 0,
            last_attempt: None,
            last_error: None,
            retryable: true,
            last_synced: None,
            local_modified: None,
            remote_updated: None,
            failure_count: 0,
        }
    }

    pub fn marker(&self) -> SyncMarker {
        SyncMarker {
            dirty: self.dirty,
            local_modified: self.local_modified,
            remote_updated: self.remote_updated,
        }
    }

    /// Merge a persisted marker into this entry.
    ///
    /// Dirtiness only ever gets added here; clearing it is up to a push.
    pub fn restore(&mut self, marker: &SyncMarker) {
        if marker.dirty && !self.dirty {
            self.dirty = true;
            self.generation += 1;
            self.retryable = true;
            if self.status != SyncStatus::Syncing {
                self.status = SyncStatus::Pending;
            }
        }
        self.local_modified = self.local_modified.max(marker.local_modified);
        self.remote_updated = self.remote_updated.max(marker.remote_updated);
    }

    /// Record a local write.
    pub fn mark_local_modified(&mut self) {
        self.dirty = true;
        self.generation += 1;
        self.local_modified = Some(Utc::now());
        // A fresh payload deserves a fresh attempt, even after a rejection.
        self.retryable = true;
        if self.status != SyncStatus::Syncing {
            self.status = SyncStatus::Pending;
        }
    }

    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
        self.last_attempt = Some(Utc::now());
    }

    /// Record a successful push of the payload written at `generation`.
    pub fn mark_pushed(&mut self, generation: u64, stored_at: DateTime<Utc>) {
        if self.generation == generation {
            self.dirty = false;
        }
        self.remote_updated = Some(stored_at);
        self.retryable = true;
    }

    /// Record that a remote record was seen (applied or not).
    pub fn mark_remote_seen(&mut self, remote_updated: DateTime<Utc>) {
        if self.remote_updated.map_or(true, |seen| remote_updated > seen) {
            self.remote_updated = Some(remote_updated);
        }
    }

    /// Finish a cycle for this type without error.
    pub fn mark_synced(&mut self) {
        if self.dirty {
            // Written again mid-cycle, or the push is being withheld.
            self.status = if self.retryable {
                SyncStatus::Pending
            } else {
                SyncStatus::Error
            };
            return;
        }
        self.status = SyncStatus::Synced;
        self.last_synced = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, error: &Error) {
        self.status = SyncStatus::Error;
        self.failure_count += 1;
        self.last_error = Some(error.to_string());
        self.retryable = error.is_retryable();
    }

    /// Put the entry back into a waiting state after a connectivity loss.
    pub fn mark_deferred(&mut self, previous: SyncStatus) {
        self.status = if self.dirty {
            SyncStatus::Pending
        } else {
            previous
        };
    }

    /// Whether the next cycle should push this type.
    pub fn needs_push(&self) -> bool {
        self.dirty && self.retryable
    }
}

/// Sync state for one tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    entries: BTreeMap<DataType, SyncEntry>,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub sync_in_progress: bool,
    /// Set while the active tenant could not be confirmed remotely.
    pub tenant_missing: bool,
}

impl SyncState {
    /// State with an idle entry for every data type.
    pub fn new() -> Self {
        Self {
            entries: DataType::ALL
                .iter()
                .map(|dt| (*dt, SyncEntry::new(*dt)))
                .collect(),
            last_full_sync: None,
            sync_in_progress: false,
            tenant_missing: false,
        }
    }

    pub fn get(&self, data_type: DataType) -> Option<&SyncEntry> {
        self.entries.get(&data_type)
    }

    pub fn entry_mut(&mut self, data_type: DataType) -> &mut SyncEntry {
        self.entries
            .entry(data_type)
            .or_insert_with(|| SyncEntry::new(data_type))
    }

    pub fn entries(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.values()
    }

    pub fn status_of(&self, data_type: DataType) -> SyncStatus {
        self.get(data_type).map_or(SyncStatus::Idle, |e| e.status)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.entries.values().any(|e| e.dirty)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_idle() {
        let state = SyncState::new();
        assert_eq!(state.entries().count(), DataType::ALL.len());
        assert!(state.entries().all(|e| e.status == SyncStatus::Idle));
        assert!(!state.has_pending_changes());
    }

    #[test]
    fn test_dirty_push_synced_lifecycle() {
        let mut entry = SyncEntry::new(DataType::Settings);

        entry.mark_local_modified();
        assert_eq!(entry.status, SyncStatus::Pending);
        assert!(entry.needs_push());

        let generation = entry.generation;
        entry.mark_syncing();
        entry.mark_pushed(generation, Utc::now());
        entry.mark_synced();

        assert_eq!(entry.status, SyncStatus::Synced);
        assert!(!entry.dirty);
        assert!(entry.last_synced.is_some());
    }

    #[test]
    fn test_write_during_push_stays_dirty() {
        let mut entry = SyncEntry::new(DataType::Staff);
        entry.mark_local_modified();
        let generation = entry.generation;
        entry.mark_syncing();

        entry.mark_local_modified();
        assert_eq!(entry.status, SyncStatus::Syncing);

        entry.mark_pushed(generation, Utc::now());
        entry.mark_synced();
        assert!(entry.dirty);
        assert_eq!(entry.status, SyncStatus::Pending);
    }

    #[test]
    fn test_rejection_is_not_retried_until_next_write() {
        let mut entry = SyncEntry::new(DataType::Services);
        entry.mark_local_modified();
        entry.mark_failed(&Error::RemoteRejection("bad json".to_string()));

        assert_eq!(entry.status, SyncStatus::Error);
        assert!(!entry.needs_push());

        // Withheld entries keep their error through a clean pull.
        entry.mark_synced();
        assert_eq!(entry.status, SyncStatus::Error);

        entry.mark_local_modified();
        assert!(entry.needs_push());
    }

    #[test]
    fn test_network_failure_is_retried() {
        let mut entry = SyncEntry::new(DataType::Themes);
        entry.mark_local_modified();
        entry.mark_failed(&Error::Timeout("8s".to_string()));

        assert_eq!(entry.status, SyncStatus::Error);
        assert_eq!(entry.failure_count, 1);
        assert!(entry.needs_push());
    }

    #[test]
    fn test_deferred_restores_clean_status() {
        let mut clean = SyncEntry::new(DataType::Appointments);
        clean.mark_syncing();
        clean.mark_deferred(SyncStatus::Synced);
        assert_eq!(clean.status, SyncStatus::Synced);

        let mut dirty = SyncEntry::new(DataType::Appointments);
        dirty.mark_local_modified();
        dirty.mark_syncing();
        dirty.mark_deferred(SyncStatus::Pending);
        assert_eq!(dirty.status, SyncStatus::Pending);
    }

    #[test]
    fn test_remote_seen_only_moves_forward() {
        let mut entry = SyncEntry::new(DataType::Settings);
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);

        entry.mark_remote_seen(later);
        entry.mark_remote_seen(earlier);
        assert_eq!(entry.remote_updated, Some(later));
    }

    #[test]
    fn test_restored_marker_keeps_write_pending() {
        let mut before = SyncEntry::new(DataType::Settings);
        before.mark_local_modified();
        before.mark_remote_seen(Utc::now() - chrono::Duration::seconds(30));
        let marker = before.marker();

        let mut after = SyncEntry::new(DataType::Settings);
        after.restore(&marker);
        assert!(after.dirty);
        assert!(after.needs_push());
        assert_eq!(after.status, SyncStatus::Pending);
        assert_eq!(after.local_modified, before.local_modified);
        assert_eq!(after.remote_updated, before.remote_updated);

        // A clean marker never undoes a local write.
        after.restore(&SyncMarker::default());
        assert!(after.dirty);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let mut state = SyncState::new();
        state.entry_mut(DataType::Settings).mark_local_modified();
        state.tenant_missing = true;

        let json = state.to_json().unwrap();
        assert!(json.contains("\"pending\""));

        let restored = SyncState::from_json(&json).unwrap();
        assert_eq!(restored.status_of(DataType::Settings), SyncStatus::Pending);
        assert!(restored.tenant_missing);
        assert!(restored.has_pending_changes());
    }
}
