//! Core configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tenantsync_common::{Error, Result, TenantId};
use tenantsync_sync::{ConflictStrategy, HttpBackend, MemoryBackend, RemoteBackend, SyncMode};

/// Bounds for the per-call remote timeout, in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 10_000;

/// Profile store selection, resolved through the store registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Registered store name ("memory", "local", "sqlite").
    pub kind: String,
    /// Store-specific options, e.g. `root` or `path`.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            kind: "memory".to_string(),
            options: Map::new(),
        }
    }

    pub fn local(root: impl AsRef<Path>) -> Self {
        Self::with_option("local", "root", root)
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::with_option("sqlite", "path", path)
    }

    fn with_option(kind: &str, key: &str, path: impl AsRef<Path>) -> Self {
        let mut options = Map::new();
        options.insert(
            key.to_string(),
            Value::String(path.as_ref().to_string_lossy().into_owned()),
        );
        Self {
            kind: kind.to_string(),
            options,
        }
    }

    pub fn options_value(&self) -> Value {
        Value::Object(self.options.clone())
    }
}

/// Remote backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// In-process backend; nothing leaves the process.
    Memory,
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        /// Whether the remote procedures are provisioned.
        #[serde(default = "default_true")]
        rpc_enabled: bool,
    },
}

fn default_true() -> bool {
    true
}

impl RemoteConfig {
    pub fn rpc_enabled(&self) -> bool {
        match self {
            RemoteConfig::Memory => true,
            RemoteConfig::Http { rpc_enabled, .. } => *rpc_enabled,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn RemoteBackend>> {
        match self {
            RemoteConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
            RemoteConfig::Http {
                base_url, api_key, ..
            } => Ok(Arc::new(HttpBackend::new(base_url, api_key.clone())?)),
        }
    }
}

/// When automatic cycles run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Manual,
    #[default]
    Periodic,
}

/// Configuration for a [`crate::SyncCore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub remote: RemoteConfig,
    /// Active tenant at start-up.
    pub tenant: Option<String>,
    /// Per-call remote timeout; clamped to 5-10 seconds.
    pub timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub sync_mode: ScheduleMode,
    pub conflict_strategy: ConflictStrategy,
    /// Drive connectivity from reachability probes instead of platform signals.
    pub probe_interval_secs: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::memory(),
            remote: RemoteConfig::Memory,
            tenant: None,
            timeout_ms: 8_000,
            sync_interval_secs: 60,
            sync_mode: ScheduleMode::default(),
            conflict_strategy: ConflictStrategy::default(),
            probe_interval_secs: None,
        }
    }
}

impl CoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS))
    }

    pub fn sync_mode(&self) -> SyncMode {
        match self.sync_mode {
            ScheduleMode::Manual => SyncMode::Manual,
            ScheduleMode::Periodic => SyncMode::Periodic {
                interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            },
        }
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn tenant_id(&self) -> Result<Option<TenantId>> {
        self.tenant.as_deref().map(TenantId::new).transpose()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid config: {}", e)))
    }

    /// Load from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
