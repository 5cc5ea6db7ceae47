//! Remote backend trait definition.
//!
//! The backend exposes two surfaces: named remote procedures, and direct
//! row access to the underlying tables. Transports are built on top.

use async_trait::async_trait;
use serde_json::Value;

use tenantsync_common::Result;

/// Tenant registry table.
pub const TENANTS_TABLE: &str = "tenants";
/// One row per `(tenant_id, data_type)`.
pub const SYNC_DATA_TABLE: &str = "sync_data";
/// Append-only audit trail.
pub const SYNC_LOGS_TABLE: &str = "sync_logs";

/// Conflict key of [`SYNC_DATA_TABLE`].
pub const SYNC_DATA_CONFLICT_KEY: [&str; 2] = ["tenant_id", "data_type"];

pub const RPC_UPDATE_SYNC_DATA: &str = "update_sync_data";
pub const RPC_GET_LATEST_SYNC_DATA: &str = "get_latest_sync_data";
pub const RPC_GET_TENANT_SYNC_DATA: &str = "get_tenant_sync_data";
pub const RPC_RESOLVE_SYNC_CONFLICT: &str = "resolve_sync_conflict";

/// Row filter for [`RemoteBackend::select`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Equality filters, all of which must match.
    pub filters: Vec<(String, String)>,
    /// Column to sort by, descending.
    pub order_desc: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_desc = Some(column.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` satisfies every equality filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|(column, expected)| {
            match row.get(column) {
                Some(Value::String(s)) => s == expected,
                Some(other) => other.to_string() == *expected,
                None => false,
            }
        })
    }
}

/// Shared backend holding the tenant, sync and log tables.
///
/// Errors follow the common taxonomy: `RpcUnavailable` for a procedure that
/// does not exist, `TenantMissing` for a referential failure on the tenant,
/// `RemoteRejection` for schema/validation failures, `Network` for transport
/// failures.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get the backend name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Lightweight reachability probe.
    async fn ping(&self) -> Result<()>;

    /// Invoke a remote procedure with named parameters.
    async fn rpc(&self, function: &str, params: Value) -> Result<Value>;

    /// Read rows from `table`.
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>>;

    /// Append a row to `table`.
    async fn insert(&self, table: &str, row: Value) -> Result<()>;

    /// Insert `row`, or overwrite the row sharing the `on_conflict` columns.
    ///
    /// # Returns
    /// The stored row.
    async fn upsert(&self, table: &str, row: Value, on_conflict: &[&str]) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_matches() {
        let query = Query::new().eq("tenant_id", "t1").eq("data_type", "staff");

        assert!(query.matches(&json!({"tenant_id": "t1", "data_type": "staff"})));
        assert!(!query.matches(&json!({"tenant_id": "t2", "data_type": "staff"})));
        assert!(!query.matches(&json!({"tenant_id": "t1"})));
    }

    #[test]
    fn test_query_matches_non_string_columns() {
        let query = Query::new().eq("version", "3");
        assert!(query.matches(&json!({"version": 3})));
    }

    #[test]
    fn test_query_builder() {
        let query = Query::new()
            .eq("tenant_id", "t1")
            .order_desc("last_updated")
            .limit(1);

        assert_eq!(query.order_desc.as_deref(), Some("last_updated"));
        assert_eq!(query.limit, Some(1));
    }
}
