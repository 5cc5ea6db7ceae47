//! Sync orchestrator: dirty tracking and full sync cycles.
//!
//! Within one cycle data types are processed in sequence, each one pushed if
//! dirty and then pulled. Only one cycle runs at a time per orchestrator; a
//! call arriving while one is in flight returns a skipped result.
//!
//! Tracking is kept per tenant. The durable part of each entry (dirty flag,
//! local and remote stamps) is mirrored to the profile store under
//! `tenant:{id}:__sync:{type}`, so a reload or a tenant switch never forgets
//! an unpushed write.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use tenantsync_common::{DataType, Error, Result, SyncRecord, TenantId};
use tenantsync_storage::{ChangeSource, Subscription, TenantKeyedStore};

use crate::client::RemoteSyncClient;
use crate::conflict::{ConflictInfo, ConflictResolver, Resolution};
use crate::scheduler::{SyncRequest, SyncResult};
use crate::state::{SyncEntry, SyncMarker, SyncState, SyncStatus};

/// Base-key prefix of the persisted tracking markers.
const MARKER_PREFIX: &str = "__sync:";

/// How one data type ended a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    Failed,
    Pending,
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Per-tenant sync state, mirrored to the profile store.
struct Tracker {
    store: Arc<TenantKeyedStore>,
    states: RwLock<HashMap<TenantId, SyncState>>,
}

impl Tracker {
    fn marker_key(tenant_id: &TenantId, data_type: DataType) -> String {
        let base = format!("{}{}", MARKER_PREFIX, data_type.as_str());
        TenantKeyedStore::scoped_key(Some(tenant_id), &base)
    }

    fn load_marker(&self, tenant_id: &TenantId, data_type: DataType) -> Option<SyncMarker> {
        let key = Self::marker_key(tenant_id, data_type);
        let raw = match self.store.backend().get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read sync marker {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring corrupt sync marker {}: {}", key, e);
                None
            }
        }
    }

    fn save_marker(&self, tenant_id: &TenantId, data_type: DataType, marker: &SyncMarker) {
        let key = Self::marker_key(tenant_id, data_type);
        let saved = serde_json::to_string(marker)
            .map_err(Error::from)
            .and_then(|raw| self.store.backend().set(&key, &raw));
        if let Err(e) = saved {
            error!("Failed to persist sync marker {}: {}", key, e);
        }
    }

    fn load_state(&self, tenant_id: &TenantId) -> SyncState {
        let mut state = SyncState::new();
        for data_type in DataType::ALL {
            if let Some(marker) = self.load_marker(tenant_id, data_type) {
                state.entry_mut(data_type).restore(&marker);
            }
        }
        state
    }

    fn update<R>(&self, tenant_id: &TenantId, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(tenant_id.clone())
            .or_insert_with(|| self.load_state(tenant_id));
        f(state)
    }

    /// Mutate one entry, persisting its marker if it changed.
    fn with_entry<R>(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        f: impl FnOnce(&mut SyncEntry) -> R,
    ) -> R {
        self.update(tenant_id, |state| {
            let entry = state.entry_mut(data_type);
            let before = entry.marker();
            let out = f(entry);
            let after = entry.marker();
            if after != before {
                self.save_marker(tenant_id, data_type, &after);
            }
            out
        })
    }

    /// Pick up writes another tab of this profile has not pushed yet.
    fn refresh(&self, tenant_id: &TenantId, data_type: DataType) {
        if let Some(marker) = self.load_marker(tenant_id, data_type) {
            self.update(tenant_id, |state| state.entry_mut(data_type).restore(&marker));
        }
    }

    fn snapshot(&self, tenant_id: &TenantId) -> SyncState {
        self.update(tenant_id, |state| state.clone())
    }
}

/// Coordinates local writes with the remote for one tab.
pub struct SyncOrchestrator {
    store: Arc<TenantKeyedStore>,
    client: Arc<RemoteSyncClient>,
    resolver: ConflictResolver,
    tracker: Arc<Tracker>,
    in_flight: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<TenantKeyedStore>,
        client: Arc<RemoteSyncClient>,
        resolver: ConflictResolver,
    ) -> Self {
        let tracker = Arc::new(Tracker {
            store: store.clone(),
            states: RwLock::new(HashMap::new()),
        });
        Self {
            store,
            client,
            resolver,
            tracker,
            in_flight: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &Arc<RemoteSyncClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<TenantKeyedStore> {
        &self.store
    }

    /// Start tracking local writes on the store's bus.
    ///
    /// Only writes made in this tab mark a type dirty; cross-tab relays and
    /// applied pulls are already accounted for elsewhere. Calling it again is
    /// a no-op.
    pub fn attach(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.is_empty() {
            return;
        }

        for data_type in DataType::ALL {
            let tracker = Arc::downgrade(&self.tracker);
            let subscription = self.store.bus().subscribe(data_type.as_str(), move |event| {
                if event.source != ChangeSource::Local {
                    return;
                }
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                // Untenanted writes have nowhere to sync to.
                if let Some(tenant_id) = tracker.store.current_tenant() {
                    tracker.with_entry(&tenant_id, data_type, SyncEntry::mark_local_modified);
                    debug!("{} marked dirty for {}", data_type, tenant_id);
                }
            });
            subscriptions.push(subscription);
        }
    }

    /// Stop tracking local writes.
    pub fn detach(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    /// Mark a type of the active tenant dirty without a write, e.g. to push
    /// data that predates tracking.
    pub fn mark_dirty(&self, data_type: DataType) {
        if let Some(tenant_id) = self.store.current_tenant() {
            self.tracker
                .with_entry(&tenant_id, data_type, SyncEntry::mark_local_modified);
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the per-type status of the active tenant.
    pub fn get_sync_status(&self) -> SyncState {
        let mut state = match self.store.current_tenant() {
            Some(tenant_id) => self.tracker.snapshot(&tenant_id),
            None => SyncState::new(),
        };
        state.sync_in_progress = self.is_syncing();
        state
    }

    /// Push and pull every data type.
    pub async fn force_sync_all(&self, tenant_id: &TenantId) -> SyncResult {
        self.sync_types(tenant_id, &DataType::ALL).await
    }

    /// Push and pull the given data types, in order.
    pub async fn sync_types(&self, tenant_id: &TenantId, types: &[DataType]) -> SyncResult {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            debug!("Sync cycle already in flight, ignoring request");
            return SyncResult::skipped();
        };
        let started = Instant::now();
        let mut result = SyncResult::default();

        if !self.confirm_tenant(tenant_id).await {
            self.defer_all(tenant_id, types);
            result.types_pending = types.len();
            result.duration = started.elapsed();
            return result;
        }

        for data_type in types {
            let (outcome, conflict) = self.sync_one(tenant_id, *data_type).await;
            match outcome {
                Outcome::Synced => result.types_synced += 1,
                Outcome::Failed => result.types_failed += 1,
                Outcome::Pending => result.types_pending += 1,
            }
            if conflict {
                result.conflicts_found += 1;
            }
        }

        if types.len() == DataType::ALL.len() && result.types_failed == 0 && result.types_pending == 0 {
            self.tracker.update(tenant_id, |state| {
                state.last_full_sync = Some(chrono::Utc::now());
            });
        }

        result.duration = started.elapsed();
        info!(
            "Sync cycle for {}: {} synced, {} failed, {} pending, {} conflicts in {:?}",
            tenant_id,
            result.types_synced,
            result.types_failed,
            result.types_pending,
            result.conflicts_found,
            result.duration
        );
        result
    }

    /// Load every remote record newer than what this tab has seen.
    ///
    /// Nothing is pushed. Dirty types go through conflict resolution.
    pub async fn hydrate(&self, tenant_id: &TenantId) -> SyncResult {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            return SyncResult::skipped();
        };
        let started = Instant::now();
        let mut result = SyncResult::default();

        if !self.confirm_tenant(tenant_id).await {
            self.defer_all(tenant_id, &DataType::ALL);
            result.types_pending = DataType::ALL.len();
            result.duration = started.elapsed();
            return result;
        }

        match self.client.try_pull_all(tenant_id).await {
            Ok(records) => {
                for data_type in DataType::ALL {
                    self.tracker.refresh(tenant_id, data_type);
                    let conflict = match records.get(&data_type) {
                        Some(record) => match self.adopt(tenant_id, record).await {
                            Ok(conflict) => conflict,
                            Err(e) => {
                                self.with_entry(tenant_id, data_type, |entry| entry.mark_failed(&e));
                                result.types_failed += 1;
                                continue;
                            }
                        },
                        None => false,
                    };
                    self.with_entry(tenant_id, data_type, SyncEntry::mark_synced);
                    result.types_synced += 1;
                    if conflict {
                        result.conflicts_found += 1;
                    }
                }
            }
            Err(e) => {
                warn!("Hydration of {} failed: {}", tenant_id, e);
                self.defer_all(tenant_id, &DataType::ALL);
                result.types_pending = DataType::ALL.len();
            }
        }

        result.duration = started.elapsed();
        result
    }

    /// Write a caller-merged payload locally and store it remotely as an
    /// explicit resolution.
    pub async fn resolve_conflict(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        resolved: serde_json::Value,
    ) -> bool {
        if let Err(e) = self.store.write_for(tenant_id, data_type.as_str(), resolved.clone()) {
            error!("Failed to store resolution for {}: {}", data_type, e);
            return false;
        }
        // Inactive tenants do not reach the bus subscription.
        let generation = self.with_entry(tenant_id, data_type, |entry| {
            if !entry.dirty {
                entry.mark_local_modified();
            }
            entry.generation
        });

        match self.client.try_resolve_conflict(tenant_id, data_type, resolved).await {
            Ok(record) => {
                self.with_entry(tenant_id, data_type, |entry| {
                    entry.mark_pushed(generation, record.last_updated);
                    entry.mark_synced();
                });
                true
            }
            Err(e) => {
                self.record_failure(tenant_id, data_type, SyncStatus::Pending, &e);
                false
            }
        }
    }

    /// Entry point for the scheduler.
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncResult> {
        let Some(tenant_id) = self.store.current_tenant() else {
            debug!("No active tenant, nothing to sync");
            return Ok(SyncResult::default());
        };
        match request {
            SyncRequest::Full => Ok(self.force_sync_all(&tenant_id).await),
            SyncRequest::Types(types) => Ok(self.sync_types(&tenant_id, &types).await),
            SyncRequest::Shutdown => Err(Error::InvalidInput(
                "Shutdown is handled by the scheduler".to_string(),
            )),
        }
    }

    async fn confirm_tenant(&self, tenant_id: &TenantId) -> bool {
        let missing = match self.client.try_ensure_tenant_exists(tenant_id).await {
            Ok(()) => false,
            Err(e) if e.is_connectivity() => {
                // Keep the last known flag until the backend answers.
                debug!("Tenant check for {} deferred: {}", tenant_id, e);
                return false;
            }
            Err(e) => {
                warn!("Sync withheld, tenant {} unavailable remotely: {}", tenant_id, e);
                true
            }
        };
        self.tracker
            .update(tenant_id, |state| state.tenant_missing = missing);
        !missing
    }

    fn defer_all(&self, tenant_id: &TenantId, types: &[DataType]) {
        for data_type in types {
            self.with_entry(tenant_id, *data_type, |entry| {
                let previous = entry.status;
                entry.mark_deferred(previous);
            });
        }
    }

    async fn sync_one(&self, tenant_id: &TenantId, data_type: DataType) -> (Outcome, bool) {
        self.tracker.refresh(tenant_id, data_type);
        let (previous, needs_push, generation) = self.with_entry(tenant_id, data_type, |entry| {
            let previous = entry.status;
            entry.mark_syncing();
            (previous, entry.needs_push(), entry.generation)
        });

        if needs_push {
            if let Err(e) = self.push_one(tenant_id, data_type, generation).await {
                return (self.record_failure(tenant_id, data_type, previous, &e), false);
            }
        }

        let conflict = match self.client.try_pull(tenant_id, data_type).await {
            Ok(Some(record)) => match self.adopt(tenant_id, &record).await {
                Ok(conflict) => conflict,
                Err(e) => return (self.record_failure(tenant_id, data_type, previous, &e), false),
            },
            Ok(None) => false,
            Err(e) => return (self.record_failure(tenant_id, data_type, previous, &e), false),
        };

        let status = self.with_entry(tenant_id, data_type, |entry| {
            entry.mark_synced();
            entry.status
        });
        let outcome = match status {
            SyncStatus::Synced => Outcome::Synced,
            SyncStatus::Error => Outcome::Failed,
            _ => Outcome::Pending,
        };
        (outcome, conflict)
    }

    async fn push_one(&self, tenant_id: &TenantId, data_type: DataType, generation: u64) -> Result<()> {
        let Some(payload) = self.store.read_for(tenant_id, data_type.as_str())? else {
            debug!("{} marked dirty but has no local payload", data_type);
            self.with_entry(tenant_id, data_type, |entry| {
                entry.mark_pushed(generation, chrono::Utc::now())
            });
            return Ok(());
        };

        let record = self.client.try_push(tenant_id, data_type, payload).await?;
        self.with_entry(tenant_id, data_type, |entry| {
            entry.mark_pushed(generation, record.last_updated)
        });
        self.client
            .log_event(
                tenant_id,
                "push",
                Some(data_type),
                json!({ "version": record.version }),
            )
            .await;
        Ok(())
    }

    /// Apply a remote record if it is new to this tab.
    ///
    /// # Returns
    /// Whether a conflict was detected.
    async fn adopt(&self, tenant_id: &TenantId, record: &SyncRecord) -> Result<bool> {
        let data_type = record.data_type;
        let own_device = self.client.device_id().clone();

        let (newer, dirty, conflict) = self.with_entry(tenant_id, data_type, |entry| {
            let conflict = self.resolver.detect_conflict(entry, record, &own_device);
            let conflict = conflict.then(|| ConflictInfo::from_entry_and_remote(tenant_id, entry, record));
            (ConflictResolver::is_remote_newer(entry, record), entry.dirty, conflict)
        });
        if !newer {
            return Ok(false);
        }

        let apply = match &conflict {
            Some(info) => {
                let resolution = self.resolver.resolve(info);
                warn!(
                    "Conflict on {} for {}: remote from {} at {}, resolved as {}",
                    data_type, tenant_id, info.remote_device, info.remote_updated, resolution
                );
                self.client
                    .log_event(
                        tenant_id,
                        "conflict",
                        Some(data_type),
                        json!({
                            "strategy": self.resolver.strategy(),
                            "resolution": resolution.to_string(),
                            "remote_device": info.remote_device,
                        }),
                    )
                    .await;
                resolution == Resolution::TakeRemote
            }
            // Unpushed writes from this profile are newer than its own remote records.
            None => !dirty,
        };

        if apply {
            self.store
                .apply_remote(tenant_id, data_type.as_str(), record.payload.clone())?;
            self.with_entry(tenant_id, data_type, |entry| {
                entry.dirty = false;
                entry.retryable = true;
            });
            debug!("Applied remote {} for {} (version {})", data_type, tenant_id, record.version);
            if record.device_id != own_device {
                self.client
                    .log_event(
                        tenant_id,
                        "pull",
                        Some(data_type),
                        json!({ "version": record.version, "from": record.device_id }),
                    )
                    .await;
            }
        }
        self.with_entry(tenant_id, data_type, |entry| {
            entry.mark_remote_seen(record.last_updated)
        });
        Ok(conflict.is_some())
    }

    fn record_failure(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        previous: SyncStatus,
        error: &Error,
    ) -> Outcome {
        match error {
            Error::Offline => {
                self.with_entry(tenant_id, data_type, |entry| entry.mark_deferred(previous));
                Outcome::Pending
            }
            Error::TenantMissing(_) => {
                self.tracker
                    .update(tenant_id, |state| state.tenant_missing = true);
                self.with_entry(tenant_id, data_type, |entry| entry.mark_deferred(previous));
                Outcome::Pending
            }
            Error::RemoteRejection(_) | Error::InvalidInput(_) => {
                error!("{} rejected, not retrying until it changes: {}", data_type, error);
                self.with_entry(tenant_id, data_type, |entry| entry.mark_failed(error));
                Outcome::Failed
            }
            _ => {
                warn!("{} sync failed, will retry next cycle: {}", data_type, error);
                self.with_entry(tenant_id, data_type, |entry| entry.mark_failed(error));
                Outcome::Failed
            }
        }
    }

    fn with_entry<R>(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        f: impl FnOnce(&mut SyncEntry) -> R,
    ) -> R {
        self.tracker.with_entry(tenant_id, data_type, f)
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.detach();
    }
}
