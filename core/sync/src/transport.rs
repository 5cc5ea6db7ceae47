//! Sync transports: the procedure path and the direct-table path.
//!
//! Both write the same row shape under the same conflict key
//! `(tenant_id, data_type)` and stamp the same fields, so a caller cannot
//! tell which one served a request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use tenantsync_common::{next_stamp, DataType, DeviceId, Error, Result, SyncRecord, TenantId};

use crate::backend::{
    Query, RemoteBackend, RPC_GET_LATEST_SYNC_DATA, RPC_GET_TENANT_SYNC_DATA,
    RPC_RESOLVE_SYNC_CONFLICT, RPC_UPDATE_SYNC_DATA, SYNC_DATA_CONFLICT_KEY, SYNC_DATA_TABLE,
    SYNC_LOGS_TABLE,
};

/// A stamped write of one payload.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub tenant_id: TenantId,
    pub data_type: DataType,
    pub payload: Value,
    pub device_id: DeviceId,
    /// Client-side write time.
    pub stamped_at: DateTime<Utc>,
}

/// Strategy for moving sync records to and from the backend.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Last-writer-wins upsert of one record.
    async fn write(&self, request: &WriteRequest) -> Result<SyncRecord>;

    /// Upsert of an explicit, caller-merged payload.
    async fn resolve(&self, request: &WriteRequest) -> Result<SyncRecord>;

    /// Latest record for one data type.
    async fn latest(&self, tenant_id: &TenantId, data_type: DataType) -> Result<Option<SyncRecord>>;

    /// Latest record for every data type of a tenant.
    async fn all(&self, tenant_id: &TenantId) -> Result<Vec<SyncRecord>>;
}

fn parse_record(row: Value) -> Result<SyncRecord> {
    serde_json::from_value(row).map_err(|e| Error::Serialization(format!("Malformed sync row: {}", e)))
}

/// Keep the newest row per data type; rows of unknown types are skipped.
fn newest_per_type(rows: Vec<Value>) -> Vec<SyncRecord> {
    let mut newest: BTreeMap<DataType, SyncRecord> = BTreeMap::new();

    for row in rows {
        match parse_record(row) {
            Ok(record) => match newest.get(&record.data_type) {
                Some(current) if current.last_updated >= record.last_updated => {}
                _ => {
                    newest.insert(record.data_type, record);
                }
            },
            Err(e) => debug!("Skipping sync row: {}", e),
        }
    }
    newest.into_values().collect()
}

/// Server-side atomic operations via remote procedures.
pub struct RpcTransport {
    backend: Arc<dyn RemoteBackend>,
}

impl RpcTransport {
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }

    fn single(value: Value) -> Result<Option<SyncRecord>> {
        match value {
            Value::Null => Ok(None),
            Value::Array(rows) => rows.into_iter().next().map(parse_record).transpose(),
            row => parse_record(row).map(Some),
        }
    }

    fn required(value: Value, function: &str) -> Result<SyncRecord> {
        Self::single(value)?.ok_or_else(|| {
            Error::RpcUnavailable(format!("{} returned no row", function))
        })
    }
}

#[async_trait]
impl SyncTransport for RpcTransport {
    fn name(&self) -> &str {
        "rpc"
    }

    async fn write(&self, request: &WriteRequest) -> Result<SyncRecord> {
        let params = json!({
            "tenant_id": request.tenant_id,
            "data_type": request.data_type,
            "data": request.payload,
            "device_id": request.device_id,
        });
        let value = self.backend.rpc(RPC_UPDATE_SYNC_DATA, params).await?;
        Self::required(value, RPC_UPDATE_SYNC_DATA)
    }

    async fn resolve(&self, request: &WriteRequest) -> Result<SyncRecord> {
        let params = json!({
            "tenant_id": request.tenant_id,
            "data_type": request.data_type,
            "resolved_data": request.payload,
            "device_id": request.device_id,
        });
        let value = self.backend.rpc(RPC_RESOLVE_SYNC_CONFLICT, params).await?;
        Self::required(value, RPC_RESOLVE_SYNC_CONFLICT)
    }

    async fn latest(&self, tenant_id: &TenantId, data_type: DataType) -> Result<Option<SyncRecord>> {
        let params = json!({ "tenant_id": tenant_id, "data_type": data_type });
        let value = self.backend.rpc(RPC_GET_LATEST_SYNC_DATA, params).await?;
        Self::single(value)
    }

    async fn all(&self, tenant_id: &TenantId) -> Result<Vec<SyncRecord>> {
        let params = json!({ "tenant_id": tenant_id });
        match self.backend.rpc(RPC_GET_TENANT_SYNC_DATA, params).await? {
            Value::Array(rows) => Ok(newest_per_type(rows)),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::Serialization(format!(
                "{} returned {}, expected rows",
                RPC_GET_TENANT_SYNC_DATA, other
            ))),
        }
    }
}

/// Direct reads and writes against the sync table.
pub struct DirectTableTransport {
    backend: Arc<dyn RemoteBackend>,
}

impl DirectTableTransport {
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }

    fn key_query(tenant_id: &TenantId, data_type: DataType) -> Query {
        Query::new()
            .eq("tenant_id", tenant_id.as_str())
            .eq("data_type", data_type.as_str())
    }

    async fn upsert(&self, request: &WriteRequest) -> Result<SyncRecord> {
        // Read-then-write: the version is informational, not a concurrency token.
        let current = self.latest(&request.tenant_id, request.data_type).await?;
        let (previous_stamp, version) = match &current {
            Some(record) => (Some(record.last_updated), record.version + 1),
            None => (None, 1),
        };

        let record = SyncRecord {
            tenant_id: request.tenant_id.clone(),
            data_type: request.data_type,
            payload: request.payload.clone(),
            device_id: request.device_id.clone(),
            last_updated: next_stamp(previous_stamp, request.stamped_at),
            version,
        };

        let row = serde_json::to_value(&record)?;
        let stored = self
            .backend
            .upsert(SYNC_DATA_TABLE, row, &SYNC_DATA_CONFLICT_KEY)
            .await?;
        Ok(parse_record(stored).unwrap_or(record))
    }
}

#[async_trait]
impl SyncTransport for DirectTableTransport {
    fn name(&self) -> &str {
        "direct"
    }

    async fn write(&self, request: &WriteRequest) -> Result<SyncRecord> {
        self.upsert(request).await
    }

    async fn resolve(&self, request: &WriteRequest) -> Result<SyncRecord> {
        let record = self.upsert(request).await?;

        // The procedure records the resolution itself; mirror it here.
        let log = json!({
            "tenant_id": record.tenant_id,
            "event_type": "conflict_resolved",
            "data_type": record.data_type,
            "device_id": record.device_id,
            "details": { "version": record.version },
            "created_at": Utc::now(),
        });
        if let Err(e) = self.backend.insert(SYNC_LOGS_TABLE, log).await {
            warn!("Failed to record conflict resolution: {}", e);
        }
        Ok(record)
    }

    async fn latest(&self, tenant_id: &TenantId, data_type: DataType) -> Result<Option<SyncRecord>> {
        let query = Self::key_query(tenant_id, data_type)
            .order_desc("last_updated")
            .limit(1);
        let rows = self.backend.select(SYNC_DATA_TABLE, &query).await?;
        rows.into_iter().next().map(parse_record).transpose()
    }

    async fn all(&self, tenant_id: &TenantId) -> Result<Vec<SyncRecord>> {
        let query = Query::new()
            .eq("tenant_id", tenant_id.as_str())
            .order_desc("last_updated");
        let rows = self.backend.select(SYNC_DATA_TABLE, &query).await?;
        Ok(newest_per_type(rows))
    }
}
