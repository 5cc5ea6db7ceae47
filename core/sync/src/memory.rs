//! In-memory remote backend for testing and offline demos.
//!
//! Emulates the shared tables, their constraints and the optional remote
//! procedures, with switches to simulate an unprovisioned procedure layer,
//! an unreachable server, slow responses and schema rejections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use tenantsync_common::{next_stamp, Error, Result};

use crate::backend::{
    Query, RemoteBackend, RPC_GET_LATEST_SYNC_DATA, RPC_GET_TENANT_SYNC_DATA,
    RPC_RESOLVE_SYNC_CONFLICT, RPC_UPDATE_SYNC_DATA, SYNC_DATA_CONFLICT_KEY, SYNC_DATA_TABLE,
    SYNC_LOGS_TABLE, TENANTS_TABLE,
};

type Tables = HashMap<String, Vec<Value>>;

/// In-memory backend.
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    rpc_enabled: AtomicBool,
    failing_rpcs: Mutex<HashSet<String>>,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    rejection: Mutex<Option<String>>,
    tenants_writable: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MemoryBackend {
    /// Create an empty backend with the procedure layer provisioned.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            rpc_enabled: AtomicBool::new(true),
            failing_rpcs: Mutex::new(HashSet::new()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(None),
            rejection: Mutex::new(None),
            tenants_writable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Provision or remove the whole procedure layer.
    pub fn set_rpc_enabled(&self, enabled: bool) {
        self.rpc_enabled.store(enabled, AtomicOrdering::SeqCst);
    }

    /// Make a single procedure fail as if it did not exist.
    pub fn fail_rpc(&self, function: &str) {
        lock(&self.failing_rpcs).insert(function.to_string());
    }

    /// Simulate the server being unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, AtomicOrdering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Reject every sync/log write with `reason` until cleared.
    pub fn reject_writes(&self, reason: Option<String>) {
        *lock(&self.rejection) = reason;
    }

    /// Refuse tenant creation, as a row-level security policy would.
    pub fn set_tenants_writable(&self, writable: bool) {
        self.tenants_writable.store(writable, AtomicOrdering::SeqCst);
    }

    /// Drop a tenant row, leaving its sync rows orphaned.
    pub fn remove_tenant(&self, tenant_id: &str) {
        let query = Query::new().eq("id", tenant_id);
        if let Some(rows) = lock(&self.tables).get_mut(TENANTS_TABLE) {
            rows.retain(|row| !query.matches(row));
        }
    }

    /// Calls received so far, as `kind:name` strings.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Seed a tenant row.
    pub fn add_tenant(&self, tenant_id: &str) {
        let mut tables = lock(&self.tables);
        upsert_row(
            &mut tables,
            TENANTS_TABLE,
            json!({ "id": tenant_id, "name": tenant_id }),
            &["id"],
        );
    }

    async fn enter(&self, call: String) -> Result<()> {
        debug!("memory backend call: {}", call);
        lock(&self.calls).push(call);

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.reachable.load(AtomicOrdering::SeqCst) {
            return Err(Error::Network("connection refused".to_string()));
        }
        Ok(())
    }

    /// Constraint checks shared by every write touching tenant-owned rows.
    fn check_tenant_row(&self, tables: &Tables, table: &str, row: &Value) -> Result<()> {
        if table != SYNC_DATA_TABLE && table != SYNC_LOGS_TABLE {
            return Ok(());
        }

        if let Some(reason) = lock(&self.rejection).clone() {
            return Err(Error::RemoteRejection(reason));
        }

        let tenant_id = str_field(row, "tenant_id")?;
        if !tenant_exists(tables, tenant_id) {
            return Err(Error::TenantMissing(format!(
                "insert on {} violates foreign key: tenant {} not present",
                table, tenant_id
            )));
        }

        if table == SYNC_DATA_TABLE {
            str_field(row, "data_type")?;
            if row.get("data").is_none() {
                return Err(Error::RemoteRejection(
                    "null value in column \"data\"".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Server-side atomic upsert used by the procedures.
    fn write_sync_row(&self, tables: &mut Tables, params: &Value, data_field: &str) -> Result<Value> {
        let tenant_id = str_field(params, "tenant_id")?;
        let data_type = str_field(params, "data_type")?;
        let device_id = str_field(params, "device_id")?;
        let data = params.get(data_field).cloned().unwrap_or(Value::Null);

        let key = Query::new()
            .eq("tenant_id", tenant_id)
            .eq("data_type", data_type);
        let existing = tables
            .get(SYNC_DATA_TABLE)
            .and_then(|rows| rows.iter().find(|row| key.matches(row)).cloned());

        let previous_stamp = existing
            .as_ref()
            .and_then(|row| serde_json::from_value::<DateTime<Utc>>(row["last_updated"].clone()).ok());
        let version = existing
            .as_ref()
            .and_then(|row| row["version"].as_i64())
            .unwrap_or(0)
            + 1;

        let row = json!({
            "tenant_id": tenant_id,
            "data_type": data_type,
            "data": data,
            "device_id": device_id,
            "last_updated": next_stamp(previous_stamp, Utc::now()),
            "version": version,
        });

        self.check_tenant_row(tables, SYNC_DATA_TABLE, &row)?;
        Ok(upsert_row(tables, SYNC_DATA_TABLE, row, &SYNC_DATA_CONFLICT_KEY))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::RemoteRejection(format!("missing or invalid column \"{}\"", field)))
}

fn tenant_exists(tables: &Tables, tenant_id: &str) -> bool {
    let query = Query::new().eq("id", tenant_id);
    tables
        .get(TENANTS_TABLE)
        .is_some_and(|rows| rows.iter().any(|row| query.matches(row)))
}

fn upsert_row(tables: &mut Tables, table: &str, row: Value, on_conflict: &[&str]) -> Value {
    let rows = tables.entry(table.to_string()).or_default();
    let key = on_conflict.iter().fold(Query::new(), |query, column| {
        let value = match row.get(*column) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        query.eq(*column, value)
    });

    match rows.iter_mut().find(|existing| key.matches(existing)) {
        Some(existing) => *existing = row.clone(),
        None => rows.push(row.clone()),
    }
    row
}

fn compare_column(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (a.parse::<DateTime<Utc>>(), b.parse::<DateTime<Utc>>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn select_rows(tables: &Tables, table: &str, query: &Query) -> Vec<Value> {
    let mut rows: Vec<Value> = tables
        .get(table)
        .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
        .unwrap_or_default();

    if let Some(column) = &query.order_desc {
        rows.sort_by(|a, b| compare_column(b.get(column), a.get(column)));
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    rows
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.enter("ping".to_string()).await
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        self.enter(format!("rpc:{}", function)).await?;

        if !self.rpc_enabled.load(AtomicOrdering::SeqCst) || lock(&self.failing_rpcs).contains(function)
        {
            return Err(Error::RpcUnavailable(format!(
                "function {} does not exist",
                function
            )));
        }

        let mut tables = lock(&self.tables);
        match function {
            RPC_UPDATE_SYNC_DATA => self.write_sync_row(&mut tables, &params, "data"),
            RPC_RESOLVE_SYNC_CONFLICT => {
                let row = self.write_sync_row(&mut tables, &params, "resolved_data")?;
                tables.entry(SYNC_LOGS_TABLE.to_string()).or_default().push(json!({
                    "tenant_id": row["tenant_id"],
                    "event_type": "conflict_resolved",
                    "data_type": row["data_type"],
                    "device_id": row["device_id"],
                    "details": { "version": row["version"] },
                    "created_at": Utc::now(),
                }));
                Ok(row)
            }
            RPC_GET_LATEST_SYNC_DATA => {
                let query = Query::new()
                    .eq("tenant_id", str_field(&params, "tenant_id")?)
                    .eq("data_type", str_field(&params, "data_type")?)
                    .order_desc("last_updated")
                    .limit(1);
                Ok(select_rows(&tables, SYNC_DATA_TABLE, &query)
                    .into_iter()
                    .next()
                    .unwrap_or(Value::Null))
            }
            RPC_GET_TENANT_SYNC_DATA => {
                let query = Query::new()
                    .eq("tenant_id", str_field(&params, "tenant_id")?)
                    .order_desc("last_updated");
                Ok(Value::Array(select_rows(&tables, SYNC_DATA_TABLE, &query)))
            }
            other => Err(Error::RpcUnavailable(format!(
                "function {} does not exist",
                other
            ))),
        }
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        self.enter(format!("select:{}", table)).await?;
        let tables = lock(&self.tables);
        Ok(select_rows(&tables, table, query))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<()> {
        self.enter(format!("insert:{}", table)).await?;
        let mut tables = lock(&self.tables);
        self.check_tenant_row(&tables, table, &row)?;
        tables.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &[&str]) -> Result<Value> {
        self.enter(format!("upsert:{}", table)).await?;
        if table == TENANTS_TABLE && !self.tenants_writable.load(AtomicOrdering::SeqCst) {
            return Err(Error::RemoteRejection(format!(
                "new row violates row-level security policy for table \"{}\"",
                TENANTS_TABLE
            )));
        }
        let mut tables = lock(&self.tables);
        self.check_tenant_row(&tables, table, &row)?;
        Ok(upsert_row(&mut tables, table, row, on_conflict))
    }
}
