//! Common error types for tenantsync.

use thiserror::Error;

/// Top-level error type for tenantsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connectivity monitor reports the device as offline.
    #[error("Offline: remote operation skipped")]
    Offline,

    /// A remote call did not complete within its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transport-level failure talking to the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote procedure layer is not provisioned or the call errored.
    #[error("Remote procedure unavailable: {0}")]
    RpcUnavailable(String),

    /// The tenant row does not exist remotely.
    #[error("Tenant missing: {0}")]
    TenantMissing(String),

    /// The backend rejected the payload (schema or validation failure).
    #[error("Remote rejected request: {0}")]
    RemoteRejection(String),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Offline, timeout and transport failures. These resolve on their own
    /// and are retried on the next sync cycle.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Offline | Error::Timeout(_) | Error::Network(_))
    }

    /// Whether sending the same request again could succeed.
    ///
    /// A rejected payload retried verbatim fails identically.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::RemoteRejection(_) | Error::InvalidInput(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::Offline.is_connectivity());
        assert!(Error::Timeout("push".into()).is_connectivity());
        assert!(Error::Network("reset".into()).is_connectivity());
        assert!(!Error::RemoteRejection("bad".into()).is_connectivity());
        assert!(!Error::TenantMissing("t1".into()).is_connectivity());
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        assert!(!Error::RemoteRejection("invalid json".into()).is_retryable());
        assert!(Error::TenantMissing("t1".into()).is_retryable());
        assert!(Error::Offline.is_retryable());
    }
}
