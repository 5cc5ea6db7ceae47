//! Remote sync client.
//!
//! Every operation is gated on connectivity and bounded by a timeout, and
//! tries the procedure transport before falling back to the direct-table
//! transport. The plain methods return `bool`/`Option` and never fail; the
//! `try_*` variants keep the error for callers that classify it.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tenantsync_common::{next_stamp, DataType, DeviceId, Error, Result, SyncRecord, TenantId};

use crate::backend::{Query, RemoteBackend, SYNC_LOGS_TABLE, TENANTS_TABLE};
use crate::connectivity::ConnectivityMonitor;
use crate::transport::{DirectTableTransport, RpcTransport, SyncTransport, WriteRequest};

/// Default per-call time budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Client for the shared backend.
pub struct RemoteSyncClient {
    backend: Arc<dyn RemoteBackend>,
    /// Procedure path; `None` when the deployment has no procedure layer.
    primary: Option<Arc<dyn SyncTransport>>,
    fallback: Arc<dyn SyncTransport>,
    connectivity: ConnectivityMonitor,
    device_id: DeviceId,
    timeout: Duration,
    known_tenants: RwLock<HashSet<TenantId>>,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl RemoteSyncClient {
    /// Create a client using the procedure transport with direct-table fallback.
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        connectivity: ConnectivityMonitor,
        device_id: DeviceId,
    ) -> Self {
        Self {
            primary: Some(Arc::new(RpcTransport::new(backend.clone()))),
            fallback: Arc::new(DirectTableTransport::new(backend.clone())),
            backend,
            connectivity,
            device_id,
            timeout: DEFAULT_TIMEOUT,
            known_tenants: RwLock::new(HashSet::new()),
            last_stamp: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip the procedure transport entirely.
    pub fn without_rpc(mut self) -> Self {
        self.primary = None;
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `ensure_tenant_exists` has succeeded for `tenant_id`.
    pub fn is_tenant_known(&self, tenant_id: &TenantId) -> bool {
        self.known_tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tenant_id)
    }

    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = next_stamp(*last, Utc::now());
        *last = Some(stamp);
        stamp
    }

    fn ensure_online(&self) -> Result<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(Error::Offline)
        }
    }

    /// Run `fut` against the time budget, after the connectivity gate.
    async fn bounded<T, Fut>(&self, op: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.bounded_until(op, Instant::now() + self.timeout, fut).await
    }

    async fn bounded_until<T, Fut>(&self, op: &str, deadline: Instant, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_online()?;
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} exceeded {:?}", op, self.timeout))),
        }
    }

    /// Try the procedure transport, then the direct-table transport.
    ///
    /// Both attempts share one deadline.
    async fn with_fallback<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn SyncTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        if let Some(primary) = &self.primary {
            match self.bounded_until(op, deadline, call(primary.clone())).await {
                Ok(value) => return Ok(value),
                Err(e @ (Error::Offline | Error::Timeout(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        "{} via {} failed ({}), falling back to {}",
                        op,
                        primary.name(),
                        e,
                        self.fallback.name()
                    );
                }
            }
        }
        self.bounded_until(op, deadline, call(self.fallback.clone())).await
    }

    /// Lightweight reachability probe.
    pub async fn test_connection(&self) -> bool {
        match self.bounded("test_connection", self.backend.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection test failed: {}", e);
                false
            }
        }
    }

    /// Make sure the tenant row exists, creating it if absent.
    pub async fn ensure_tenant_exists(&self, tenant_id: &TenantId) -> bool {
        match self.try_ensure_tenant_exists(tenant_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not ensure tenant {} exists: {}", tenant_id, e);
                false
            }
        }
    }

    pub async fn try_ensure_tenant_exists(&self, tenant_id: &TenantId) -> Result<()> {
        if self.is_tenant_known(tenant_id) {
            return Ok(());
        }

        let query = Query::new().eq("id", tenant_id.as_str()).limit(1);
        let rows = self
            .bounded("ensure_tenant_exists", self.backend.select(TENANTS_TABLE, &query))
            .await?;

        if rows.is_empty() {
            let row = json!({
                "id": tenant_id,
                "name": tenant_id,
                "created_at": Utc::now(),
            });
            // Upsert so a concurrent creation from another tab is harmless.
            self.bounded(
                "ensure_tenant_exists",
                self.backend.upsert(TENANTS_TABLE, row, &["id"]),
            )
            .await?;
            info!("Created remote tenant {}", tenant_id);
        }

        self.known_tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id.clone());
        Ok(())
    }

    /// Push a payload as the latest state of `(tenant, data_type)`.
    pub async fn push(&self, tenant_id: &TenantId, data_type: DataType, payload: Value) -> bool {
        self.try_push(tenant_id, data_type, payload).await.is_ok()
    }

    pub async fn try_push(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        payload: Value,
    ) -> Result<SyncRecord> {
        let request = self.write_request(tenant_id, data_type, payload);
        let result = self
            .with_fallback("push", |transport| {
                let request = request.clone();
                async move { transport.write(&request).await }
            })
            .await;
        self.report_write("push", &request, result)
    }

    /// Fetch the latest payload for `(tenant, data_type)`.
    pub async fn pull(&self, tenant_id: &TenantId, data_type: DataType) -> Option<Value> {
        match self.try_pull(tenant_id, data_type).await {
            Ok(record) => record.map(|r| r.payload),
            Err(e) => {
                warn!("Pull of {} for {} failed: {}", data_type, tenant_id, e);
                None
            }
        }
    }

    pub async fn try_pull(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
    ) -> Result<Option<SyncRecord>> {
        self.with_fallback("pull", |transport| {
            let tenant_id = tenant_id.clone();
            async move { transport.latest(&tenant_id, data_type).await }
        })
        .await
    }

    /// Fetch the latest payload of every data type for a tenant.
    pub async fn pull_all(&self, tenant_id: &TenantId) -> HashMap<DataType, Value> {
        match self.try_pull_all(tenant_id).await {
            Ok(records) => records
                .into_iter()
                .map(|(data_type, record)| (data_type, record.payload))
                .collect(),
            Err(e) => {
                warn!("Pull of all data for {} failed: {}", tenant_id, e);
                HashMap::new()
            }
        }
    }

    pub async fn try_pull_all(&self, tenant_id: &TenantId) -> Result<HashMap<DataType, SyncRecord>> {
        let records = self
            .with_fallback("pull_all", |transport| {
                let tenant_id = tenant_id.clone();
                async move { transport.all(&tenant_id).await }
            })
            .await?;
        Ok(records.into_iter().map(|r| (r.data_type, r)).collect())
    }

    /// Store an explicit, caller-merged payload.
    pub async fn resolve_conflict(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        resolved: Value,
    ) -> bool {
        self.try_resolve_conflict(tenant_id, data_type, resolved)
            .await
            .is_ok()
    }

    pub async fn try_resolve_conflict(
        &self,
        tenant_id: &TenantId,
        data_type: DataType,
        resolved: Value,
    ) -> Result<SyncRecord> {
        let request = self.write_request(tenant_id, data_type, resolved);
        let result = self
            .with_fallback("resolve_conflict", |transport| {
                let request = request.clone();
                async move { transport.resolve(&request).await }
            })
            .await;
        self.report_write("resolve_conflict", &request, result)
    }

    /// Best-effort audit entry. Failures are logged and swallowed.
    pub async fn log_event(
        &self,
        tenant_id: &TenantId,
        event_type: &str,
        data_type: Option<DataType>,
        details: Value,
    ) -> bool {
        let row = json!({
            "tenant_id": tenant_id,
            "event_type": event_type,
            "data_type": data_type,
            "device_id": self.device_id,
            "details": details,
            "created_at": Utc::now(),
        });

        match self
            .bounded("log_event", self.backend.insert(SYNC_LOGS_TABLE, row))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("Audit event {} for {} dropped: {}", event_type, tenant_id, e);
                false
            }
        }
    }

    fn write_request(&self, tenant_id: &TenantId, data_type: DataType, payload: Value) -> WriteRequest {
        WriteRequest {
            tenant_id: tenant_id.clone(),
            data_type,
            payload,
            device_id: self.device_id.clone(),
            stamped_at: self.stamp(),
        }
    }

    fn report_write(
        &self,
        op: &str,
        request: &WriteRequest,
        result: Result<SyncRecord>,
    ) -> Result<SyncRecord> {
        match &result {
            Ok(record) => debug!(
                "{} {} for {} stored (version {})",
                op, request.data_type, request.tenant_id, record.version
            ),
            Err(Error::TenantMissing(reason)) => {
                warn!(
                    "{} {} for {}: tenant missing remotely ({})",
                    op, request.data_type, request.tenant_id, reason
                );
                // Re-create it on the next ensure_tenant_exists.
                self.known_tenants
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request.tenant_id);
            }
            Err(Error::RemoteRejection(reason)) => error!(
                "{} {} for {} rejected by backend: {}; payload: {}",
                op, request.data_type, request.tenant_id, reason, request.payload
            ),
            Err(e) => warn!(
                "{} {} for {} failed: {}",
                op, request.data_type, request.tenant_id, e
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SYNC_DATA_TABLE;
    use crate::memory::MemoryBackend;
    use std::time::Instant;

    fn tenant() -> TenantId {
        TenantId::new("T1").unwrap()
    }

    fn client(backend: Arc<MemoryBackend>) -> RemoteSyncClient {
        RemoteSyncClient::new(backend, ConnectivityMonitor::new(true), DeviceId::generate())
            .with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_push_then_pull_roundtrip() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(backend.clone());
        let payload = json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]);

        assert!(client.ensure_tenant_exists(&tenant()).await);
        assert!(client.push(&tenant(), DataType::Services, payload.clone()).await);

        let pulled = client.pull(&tenant(), DataType::Services).await.unwrap();
        assert_eq!(pulled, payload);
        assert_eq!(pulled.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_push_falls_back_when_rpc_fails() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_rpc("update_sync_data");
        let client = client(backend.clone());
        client.ensure_tenant_exists(&tenant()).await;

        assert!(client.push(&tenant(), DataType::Settings, json!({"a": 1})).await);

        let calls = backend.calls();
        assert!(calls.contains(&"rpc:update_sync_data".to_string()));
        assert!(calls.contains(&"upsert:sync_data".to_string()));
        assert_eq!(
            client.pull(&tenant(), DataType::Settings).await,
            Some(json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn test_without_rpc_skips_procedures() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(backend.clone()).without_rpc();
        client.ensure_tenant_exists(&tenant()).await;

        client.push(&tenant(), DataType::Staff, json!([])).await;
        client.pull_all(&tenant()).await;

        assert!(backend.calls().iter().all(|c| !c.starts_with("rpc:")));
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_latency(Some(Duration::from_secs(5)));
        let client = client(backend.clone());
        client.connectivity().set_online(false);

        let started = Instant::now();
        assert!(!client.push(&tenant(), DataType::Settings, json!({})).await);
        assert!(client.pull(&tenant(), DataType::Settings).await.is_none());
        assert!(!client.resolve_conflict(&tenant(), DataType::Settings, json!({})).await);
        assert!(!client.test_connection().await);

        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(backend.calls().is_empty());
        assert!(matches!(
            client.try_push(&tenant(), DataType::Settings, json!({})).await,
            Err(Error::Offline)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_shares_the_time_budget() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_tenant("T1");
        backend.set_latency(Some(Duration::from_secs(30)));
        let client = client(backend.clone()).with_timeout(Duration::from_millis(300));

        let started = tokio::time::Instant::now();
        assert!(!client.push(&tenant(), DataType::Settings, json!({})).await);
        assert!(client.pull(&tenant(), DataType::Settings).await.is_none());
        let elapsed = started.elapsed();

        assert!(elapsed <= Duration::from_millis(650), "took {:?}", elapsed);
        assert!(!backend.calls().contains(&"upsert:sync_data".to_string()));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_tenant("T1");
        backend.set_latency(Some(Duration::from_secs(5)));
        let client = client(backend.clone()).with_timeout(Duration::from_millis(20));

        let err = client
            .try_pull(&tenant(), DataType::Themes)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!client.test_connection().await);
    }

    #[tokio::test]
    async fn test_ensure_tenant_creates_once() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(backend.clone());

        assert!(!client.push(&tenant(), DataType::Settings, json!({})).await);
        assert!(matches!(
            client.try_push(&tenant(), DataType::Settings, json!({})).await,
            Err(Error::TenantMissing(_))
        ));

        assert!(client.ensure_tenant_exists(&tenant()).await);
        assert!(client.ensure_tenant_exists(&tenant()).await);
        assert!(client.is_tenant_known(&tenant()));
        assert_eq!(backend.rows(TENANTS_TABLE).len(), 1);

        assert!(client.push(&tenant(), DataType::Settings, json!({})).await);

        backend.remove_tenant("T1");
        assert!(!client.push(&tenant(), DataType::Settings, json!({})).await);
        assert!(!client.is_tenant_known(&tenant()));
        assert!(client.ensure_tenant_exists(&tenant()).await);
        assert_eq!(backend.rows(TENANTS_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_push_keeps_payload() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(backend.clone());
        client.ensure_tenant_exists(&tenant()).await;
        let payload = json!({"salonName": "Spa X"});

        let first = client
            .try_push(&tenant(), DataType::Settings, payload.clone())
            .await
            .unwrap();
        let second = client
            .try_push(&tenant(), DataType::Settings, payload.clone())
            .await
            .unwrap();

        assert_eq!(first.payload, second.payload);
        assert!(second.last_updated > first.last_updated);
        assert_eq!(backend.rows(SYNC_DATA_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_log_event_failure_is_swallowed() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client(backend.clone());

        // Tenant missing: the insert is rejected, but nothing propagates.
        assert!(!client.log_event(&tenant(), "push", Some(DataType::Staff), json!({})).await);

        client.ensure_tenant_exists(&tenant()).await;
        assert!(client.log_event(&tenant(), "push", Some(DataType::Staff), json!({})).await);
        assert_eq!(backend.rows(SYNC_LOGS_TABLE)[0]["data_type"], "staff");
    }
}
