//! Tenant-scoped view over the profile store.
//!
//! Application data lives under `tenant:{tenantId}:{baseKey}` while a tenant
//! is active, and under the bare `baseKey` otherwise, which keeps data written
//! before multi-tenancy readable.

use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tenantsync_common::{Result, TenantId};

use crate::events::{ChangeSource, LocalEventBus};
use crate::notifier::{ChangeNotifier, StorageChange};
use crate::provider::KeyValueStore;

/// Fixed, non-tenant key holding the device identity.
pub const DEVICE_ID_KEY: &str = "deviceId";

/// Fixed, non-tenant key holding the active theme id.
pub const ACTIVE_THEME_KEY: &str = "activeThemeId";

const TENANT_PREFIX: &str = "tenant:";

/// Store handle for one tab.
pub struct TenantKeyedStore {
    store: Arc<dyn KeyValueStore>,
    bus: LocalEventBus,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    tenant: RwLock<Option<TenantId>>,
    /// Identifies this handle in cross-tab signals.
    origin: Uuid,
}

impl TenantKeyedStore {
    pub fn new(store: Arc<dyn KeyValueStore>, bus: LocalEventBus) -> Self {
        Self {
            store,
            bus,
            notifier: None,
            tenant: RwLock::new(None),
            origin: Uuid::new_v4(),
        }
    }

    /// Attach the cross-tab transport.
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_tenant(self, tenant: Option<TenantId>) -> Self {
        self.set_tenant(tenant);
        self
    }

    /// Effective key for `base_key` under `tenant`.
    pub fn scoped_key(tenant: Option<&TenantId>, base_key: &str) -> String {
        match tenant {
            Some(tenant) => format!("{}{}:{}", TENANT_PREFIX, tenant, base_key),
            None => base_key.to_string(),
        }
    }

    pub fn current_tenant(&self) -> Option<TenantId> {
        self.tenant
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_tenant(&self, tenant: Option<TenantId>) {
        debug!("Active tenant set to {:?}", tenant);
        *self.tenant.write().unwrap_or_else(PoisonError::into_inner) = tenant;
    }

    pub fn effective_key(&self, base_key: &str) -> String {
        Self::scoped_key(self.current_tenant().as_ref(), base_key)
    }

    pub fn bus(&self) -> &LocalEventBus {
        &self.bus
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Read the payload stored under `base_key` for the active tenant.
    pub fn read(&self, base_key: &str) -> Result<Option<Value>> {
        self.read_key(&self.effective_key(base_key))
    }

    /// Read the payload stored under `base_key` for a specific tenant.
    pub fn read_for(&self, tenant: &TenantId, base_key: &str) -> Result<Option<Value>> {
        self.read_key(&Self::scoped_key(Some(tenant), base_key))
    }

    /// Write `payload` under `base_key` for the active tenant.
    ///
    /// Subscribers of `base_key` in this tab are notified directly; other
    /// tabs are signalled through the notifier.
    pub fn write(&self, base_key: &str, payload: Value) -> Result<()> {
        let key = self.effective_key(base_key);
        self.put(&key, base_key, payload, ChangeSource::Local, true)
    }

    /// Local write for a specific tenant.
    ///
    /// In-tab subscribers are only notified when `tenant` is the active tenant.
    pub fn write_for(&self, tenant: &TenantId, base_key: &str, payload: Value) -> Result<()> {
        let key = Self::scoped_key(Some(tenant), base_key);
        let active = self.current_tenant().as_ref() == Some(tenant);
        self.put(&key, base_key, payload, ChangeSource::Local, active)
    }

    /// Store a payload obtained from the remote for `tenant`.
    ///
    /// Only notifies in-tab subscribers when `tenant` is the active tenant.
    pub fn apply_remote(&self, tenant: &TenantId, base_key: &str, payload: Value) -> Result<()> {
        let key = Self::scoped_key(Some(tenant), base_key);
        let active = self.current_tenant().as_ref() == Some(tenant);
        self.put(&key, base_key, payload, ChangeSource::Remote, active)
    }

    /// Read a fixed, non-tenant key.
    pub fn read_global(&self, key: &str) -> Result<Option<Value>> {
        self.read_key(key)
    }

    /// Write a fixed, non-tenant key.
    pub fn write_global(&self, key: &str, payload: Value) -> Result<()> {
        self.put(key, key, payload, ChangeSource::Local, true)
    }

    pub fn active_theme_id(&self) -> Result<Option<String>> {
        Ok(self
            .read_global(ACTIVE_THEME_KEY)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn set_active_theme_id(&self, theme_id: &str) -> Result<()> {
        self.write_global(ACTIVE_THEME_KEY, Value::String(theme_id.to_string()))
    }

    fn read_key(&self, key: &str) -> Result<Option<Value>> {
        match self.store.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        key: &str,
        topic: &str,
        payload: Value,
        source: ChangeSource,
        notify_local: bool,
    ) -> Result<()> {
        let raw = serde_json::to_string(&payload)?;
        self.store.set(key, &raw)?;

        if notify_local {
            self.bus.emit(topic, Some(payload), source);
        }

        if let Some(notifier) = &self.notifier {
            notifier.publish(StorageChange {
                key: key.to_string(),
                new_value: Some(raw),
                origin: self.origin,
            });
        }
        Ok(())
    }

    /// Map a change made elsewhere onto a local topic and re-emit it.
    ///
    /// # Returns
    /// `true` if subscribers were notified.
    pub fn handle_foreign_change(&self, change: &StorageChange) -> bool {
        if change.origin == self.origin {
            return false;
        }

        let topic = if change.key == ACTIVE_THEME_KEY {
            change.key.clone()
        } else if change.key == DEVICE_ID_KEY {
            return false;
        } else {
            match self.current_tenant() {
                Some(tenant) => {
                    let prefix = format!("{}{}:", TENANT_PREFIX, tenant);
                    match change.key.strip_prefix(&prefix) {
                        Some(base) => base.to_string(),
                        None => return false,
                    }
                }
                None if !change.key.starts_with(TENANT_PREFIX) => change.key.clone(),
                None => return false,
            }
        };

        let payload = match &change.new_value {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Ignoring unparsable cross-tab value for {}: {}", change.key, e);
                    return false;
                }
            },
            None => None,
        };

        self.bus.emit(&topic, payload, ChangeSource::CrossTab);
        true
    }

    /// Start relaying changes from other tabs onto this tab's bus.
    ///
    /// Must be called from within a tokio runtime. Returns `None` when no
    /// notifier is attached. The task ends once this store is dropped.
    pub fn spawn_relay(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.notifier.as_ref()?.subscribe();
        let weak = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        let Some(store) = weak.upgrade() else {
                            break;
                        };
                        store.handle_foreign_change(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Cross-tab relay lagged, {} changes skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Cross-tab relay stopped");
        }))
    }
}
