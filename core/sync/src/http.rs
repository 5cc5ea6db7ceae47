//! HTTP backend speaking the PostgREST dialect.
//!
//! Tables live under `{base}/rest/v1/{table}` and procedures under
//! `{base}/rest/v1/rpc/{function}`.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use tenantsync_common::{Error, Result};

use crate::backend::{Query, RemoteBackend, TENANTS_TABLE};

const REST_PREFIX: &str = "rest/v1/";

/// Remote backend over HTTP.
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not a valid absolute URL
    /// - HTTP client construction failure
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Configuration(format!("Invalid base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("tenantsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(REST_PREFIX)
            .and_then(|rest| rest.join(path))
            .map_err(|e| Error::Configuration(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header(header::AUTHORIZATION, format!("Bearer {}", key)),
            None => request,
        }
    }

    /// Query-string pairs for a [`Query`].
    pub fn query_params(query: &Query) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = query
            .filters
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value)))
            .collect();
        if let Some(column) = &query.order_desc {
            params.push(("order".to_string(), format!("{}.desc", column)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("{}: failed to read body: {}", what, e)))?;
        debug!("{} -> {}", what, status);

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| Error::Serialization(format!("{}: invalid response: {}", what, e)))
        } else {
            Err(classify_error(status, &body))
        }
    }
}

/// Map a failed response onto the common error taxonomy.
///
/// Postgres/PostgREST error codes take precedence over the HTTP status.
pub fn classify_error(status: StatusCode, body: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(body)
        .to_string();
    let detail = format!("{} ({})", message, status);

    match code {
        // Function not found / not in schema cache
        "PGRST202" | "42883" => Error::RpcUnavailable(detail),
        // Foreign key violation
        "23503" => Error::TenantMissing(detail),
        "22P02" | "23502" | "23514" | "42703" | "PGRST204" => Error::RemoteRejection(detail),
        _ if status == StatusCode::NOT_FOUND => Error::NotFound(detail),
        _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            Error::Network(detail)
        }
        _ => Error::RemoteRejection(detail),
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn ping(&self) -> Result<()> {
        let url = self.endpoint(TENANTS_TABLE)?;
        let request = self
            .http
            .get(url)
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(request, "ping").await.map(|_| ())
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        let url = self.endpoint(&format!("rpc/{}", function))?;
        let request = self.http.post(url).json(&params);
        match self.send(request, &format!("rpc {}", function)).await {
            // An unknown route for a procedure means it was never provisioned.
            Err(Error::NotFound(detail)) => Err(Error::RpcUnavailable(detail)),
            other => other,
        }
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let url = self.endpoint(table)?;
        let request = self.http.get(url).query(&Self::query_params(query));

        match self.send(request, &format!("select {}", table)).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn insert(&self, table: &str, row: Value) -> Result<()> {
        let url = self.endpoint(table)?;
        let request = self
            .http
            .post(url)
            .header("Prefer", "return=minimal")
            .json(&row);
        self.send(request, &format!("insert {}", table)).await.map(|_| ())
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &[&str]) -> Result<Value> {
        let url = self.endpoint(table)?;
        let request = self
            .http
            .post(url)
            .query(&[("on_conflict", on_conflict.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row);

        match self.send(request, &format!("upsert {}", table)).await? {
            Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
            Value::Array(_) | Value::Null => Ok(row),
            stored => Ok(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let backend = HttpBackend::new("https://example.supabase.co", None).unwrap();
        assert_eq!(
            backend.endpoint("rpc/update_sync_data").unwrap().as_str(),
            "https://example.supabase.co/rest/v1/rpc/update_sync_data"
        );

        let nested = HttpBackend::new("https://api.example.com/db", None).unwrap();
        assert_eq!(
            nested.endpoint("sync_data").unwrap().as_str(),
            "https://api.example.com/db/rest/v1/sync_data"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpBackend::new("not a url", None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_query_params() {
        let query = Query::new()
            .eq("tenant_id", "t1")
            .eq("data_type", "staff")
            .order_desc("last_updated")
            .limit(1);

        assert_eq!(
            HttpBackend::query_params(&query),
            vec![
                ("tenant_id".to_string(), "eq.t1".to_string()),
                ("data_type".to_string(), "eq.staff".to_string()),
                ("order".to_string(), "last_updated.desc".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_classify_error() {
        let missing_fn = r#"{"code":"PGRST202","message":"Could not find the function"}"#;
        assert!(matches!(
            classify_error(StatusCode::NOT_FOUND, missing_fn),
            Error::RpcUnavailable(_)
        ));

        let fk = r#"{"code":"23503","message":"violates foreign key constraint"}"#;
        assert!(matches!(
            classify_error(StatusCode::CONFLICT, fk),
            Error::TenantMissing(_)
        ));

        let bad_json = r#"{"code":"22P02","message":"invalid input syntax for type json"}"#;
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, bad_json),
            Error::RemoteRejection(_)
        ));

        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "upstream down"),
            Error::Network(_)
        ));
    }
}
