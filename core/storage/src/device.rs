//! Stable per-profile device identity.

use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use tenantsync_common::DeviceId;

use crate::provider::KeyValueStore;
use crate::tenant::DEVICE_ID_KEY;

/// Lazily generated, persisted device identifier.
///
/// The identifier is resolved once per handle and cached. If the store
/// cannot persist it, the failure is logged once and the generated id is
/// still used for the lifetime of this handle rather than regenerated.
pub struct DeviceIdentity {
    store: Arc<dyn KeyValueStore>,
    cached: OnceLock<DeviceId>,
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cached: OnceLock::new(),
        }
    }

    /// Get the device id, generating and persisting it on first use.
    pub fn device_id(&self) -> DeviceId {
        self.cached.get_or_init(|| self.load_or_create()).clone()
    }

    fn load_or_create(&self) -> DeviceId {
        match self.store.get(DEVICE_ID_KEY) {
            Ok(Some(raw)) => {
                let stored: String = serde_json::from_str(&raw).unwrap_or(raw);
                match DeviceId::parse(&stored) {
                    Ok(id) => return id,
                    Err(e) => warn!("Stored device id is invalid, replacing it: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => error!("Cannot read device id from {} store: {}", self.store.name(), e),
        }

        let id = DeviceId::generate();
        let raw = serde_json::Value::String(id.to_string()).to_string();
        match self.store.set(DEVICE_ID_KEY, &raw) {
            Ok(()) => info!("Generated device id {}", id),
            Err(e) => error!(
                "Failed to persist device id {}; it will change on next start: {}",
                id, e
            ),
        }
        id
    }
}
