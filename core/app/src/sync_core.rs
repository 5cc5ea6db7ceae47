//! The sync core service object.
//!
//! One [`SyncCore`] is built per tab at application start and handed to
//! feature modules. Its public methods never return errors: failures are
//! logged and reflected in the status snapshot.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tenantsync_common::{DataType, DeviceId, Result, TenantId};
use tenantsync_storage::{
    create_default_registry, BusEvent, ChangeNotifier, DeviceIdentity, KeyValueStore,
    LocalEventBus, Subscription, TenantKeyedStore, ACTIVE_THEME_KEY,
};
use tenantsync_sync::{
    ConflictResolver, ConnectivityMonitor, RemoteBackend, RemoteSyncClient, SyncOrchestrator,
    SyncResult, SyncScheduler, SyncState,
};

use crate::config::CoreConfig;

/// Builder for [`SyncCore`].
///
/// Anything not injected is created from the [`CoreConfig`].
pub struct SyncCoreBuilder {
    config: CoreConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    backend: Option<Arc<dyn RemoteBackend>>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    connectivity: Option<ConnectivityMonitor>,
}

impl SyncCoreBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            store: None,
            backend: None,
            notifier: None,
            connectivity: None,
        }
    }

    /// Use an existing profile store, e.g. one shared with other tabs.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Cross-tab transport. Without one, other tabs are not signalled.
    pub fn notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Build the core.
    ///
    /// # Errors
    /// - Unknown store kind or missing store options
    /// - Invalid tenant id or backend URL
    pub fn build(self) -> Result<SyncCore> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => create_default_registry()
                .resolve(&config.store.kind, config.store.options_value())?,
        };

        let mut keyed = TenantKeyedStore::new(store.clone(), LocalEventBus::new())
            .with_tenant(config.tenant_id()?);
        if let Some(notifier) = self.notifier {
            keyed = keyed.with_notifier(notifier);
        }
        let keyed = Arc::new(keyed);

        let device = DeviceIdentity::new(store.clone());
        let connectivity = self.connectivity.unwrap_or_default();
        let backend = match self.backend {
            Some(backend) => backend,
            None => config.remote.build()?,
        };

        let mut client =
            RemoteSyncClient::new(backend.clone(), connectivity.clone(), device.device_id())
                .with_timeout(config.timeout());
        if !config.remote.rpc_enabled() {
            client = client.without_rpc();
        }
        let client = Arc::new(client);

        let orchestrator = Arc::new(SyncOrchestrator::new(
            keyed.clone(),
            client.clone(),
            ConflictResolver::new(config.conflict_strategy),
        ));
        orchestrator.attach();

        info!(
            "Sync core ready: store={} backend={} device={}",
            store.name(),
            backend.name(),
            client.device_id()
        );

        Ok(SyncCore {
            config,
            store: keyed,
            device,
            connectivity,
            backend,
            client,
            orchestrator,
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Consumer-facing sync API for one tab.
pub struct SyncCore {
    config: CoreConfig,
    store: Arc<TenantKeyedStore>,
    device: DeviceIdentity,
    connectivity: ConnectivityMonitor,
    backend: Arc<dyn RemoteBackend>,
    client: Arc<RemoteSyncClient>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Mutex<Option<SyncScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCore {
    pub fn builder(config: CoreConfig) -> SyncCoreBuilder {
        SyncCoreBuilder::new(config)
    }

    /// Start the background work: cross-tab relay, scheduler and, if
    /// configured, the connectivity probe. Must be called from a tokio
    /// runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut scheduler_slot = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler_slot.is_some() {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(relay) = self.store.spawn_relay() {
            tasks.push(relay);
        }

        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode(), self.connectivity.clone());
        let orchestrator = self.orchestrator.clone();
        tasks.push(tokio::spawn(handle.run(move |request| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.process_request(request).await }
        })));
        *scheduler_slot = Some(scheduler);

        if let Some(interval) = self.config.probe_interval() {
            tasks.push(
                self.connectivity
                    .spawn_probe(self.backend.clone(), interval, self.config.timeout()),
            );
        }
        debug!("Sync core started with {} background tasks", tasks.len());
    }

    /// Stop the background work started by [`SyncCore::start`].
    pub async fn shutdown(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        info!("Sync core stopped");
    }

    /// Store `payload` locally for the active tenant and mark it for sync.
    pub fn write(&self, data_type: DataType, payload: Value) -> bool {
        match self.store.write(data_type.as_str(), payload) {
            Ok(()) => true,
            Err(e) => {
                error!("Local write of {} failed: {}", data_type, e);
                false
            }
        }
    }

    pub fn read(&self, data_type: DataType) -> Option<Value> {
        self.store.read(data_type.as_str()).unwrap_or_else(|e| {
            warn!("Local read of {} failed: {}", data_type, e);
            None
        })
    }

    /// Observe changes to `data_type`, from this tab, other tabs or pulls.
    pub fn subscribe<F>(&self, data_type: DataType, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.store.bus().subscribe(data_type.as_str(), handler)
    }

    /// Observe any bus topic, e.g. the active theme key.
    pub fn subscribe_key<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.store.bus().subscribe(topic, handler)
    }

    pub fn active_theme_id(&self) -> Option<String> {
        self.store.active_theme_id().unwrap_or_else(|e| {
            warn!("Failed to read {}: {}", ACTIVE_THEME_KEY, e);
            None
        })
    }

    pub fn set_active_theme_id(&self, theme_id: &str) -> bool {
        match self.store.set_active_theme_id(theme_id) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to store {}: {}", ACTIVE_THEME_KEY, e);
                false
            }
        }
    }

    /// Run a full cycle for the active tenant now.
    ///
    /// A no-op returning a skipped result while another cycle runs.
    pub async fn force_sync_all(&self) -> SyncResult {
        match self.store.current_tenant() {
            Some(tenant) => self.orchestrator.force_sync_all(&tenant).await,
            None => {
                debug!("force_sync_all without an active tenant");
                SyncResult::default()
            }
        }
    }

    /// Load remote state for the active tenant without pushing.
    pub async fn hydrate(&self) -> SyncResult {
        match self.store.current_tenant() {
            Some(tenant) => self.orchestrator.hydrate(&tenant).await,
            None => SyncResult::default(),
        }
    }

    /// Store a caller-merged payload locally and remotely.
    pub async fn resolve_conflict(&self, data_type: DataType, resolved: Value) -> bool {
        match self.store.current_tenant() {
            Some(tenant) => {
                self.orchestrator
                    .resolve_conflict(&tenant, data_type, resolved)
                    .await
            }
            None => {
                warn!("resolve_conflict for {} without an active tenant", data_type);
                false
            }
        }
    }

    /// Make sure the active tenant exists remotely.
    pub async fn ensure_tenant(&self) -> bool {
        match self.store.current_tenant() {
            Some(tenant) => self.client.ensure_tenant_exists(&tenant).await,
            None => false,
        }
    }

    pub fn get_sync_status(&self) -> SyncState {
        self.orchestrator.get_sync_status()
    }

    pub fn get_current_device_id(&self) -> DeviceId {
        self.device.device_id()
    }

    pub fn current_tenant(&self) -> Option<TenantId> {
        self.store.current_tenant()
    }

    /// Switch the active tenant. Unpushed writes of the previous tenant stay
    /// tracked and go out the next time it is synced.
    pub fn set_tenant(&self, tenant: Option<TenantId>) {
        if self.store.current_tenant() == tenant {
            return;
        }
        debug!("Switching tenant to {:?}", tenant);
        self.store.set_tenant(tenant);
    }

    /// Feed a platform online/offline signal.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Front end of the running scheduler, if started.
    pub fn scheduler(&self) -> Option<SyncScheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TenantKeyedStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<RemoteSyncClient> {
        &self.client
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }
}
