//! Common types used throughout tenantsync.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a business account. Scopes all local keys and remote rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new TenantId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains the key separator `:`
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "TenantId cannot be empty".to_string(),
            ));
        }
        if id.contains(':') {
            return Err(crate::Error::InvalidInput(
                "TenantId cannot contain ':'".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable per-profile identifier used to attribute writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a previously persisted identifier.
    pub fn parse(id: &str) -> crate::Result<Self> {
        let uuid = uuid::Uuid::parse_str(id.trim())
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid device id: {}", e)))?;
        Ok(Self(uuid.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of synchronizable payload. A tenant has at most one record per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Settings,
    Themes,
    Services,
    Staff,
    Appointments,
}

impl DataType {
    /// Every known data type, in sync order.
    pub const ALL: [DataType; 5] = [
        DataType::Settings,
        DataType::Themes,
        DataType::Services,
        DataType::Staff,
        DataType::Appointments,
    ];

    /// Wire name, also used as the local base key.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Settings => "settings",
            DataType::Themes => "themes",
            DataType::Services => "services",
            DataType::Staff => "staff",
            DataType::Appointments => "appointments",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown data type: {}", s)))
    }
}

/// The remote row holding the latest known state of one `(tenant, data type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub tenant_id: TenantId,
    pub data_type: DataType,
    /// Opaque JSON payload.
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    pub device_id: DeviceId,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

/// Next write timestamp: `now`, or one microsecond past `previous` when the
/// clock has not advanced.
pub fn next_stamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tenant_id_creation() {
        let id = TenantId::new("salon-42").unwrap();
        assert_eq!(id.as_str(), "salon-42");
    }

    #[test]
    fn test_tenant_id_rejects_empty_and_separator() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a:b").is_err());
    }

    #[test]
    fn test_device_id_parse() {
        let generated = DeviceId::generate();
        let parsed = DeviceId::parse(generated.as_str()).unwrap();
        assert_eq!(generated, parsed);
        assert!(DeviceId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_data_type_from_str() {
        assert_eq!("services".parse::<DataType>().unwrap(), DataType::Services);
        assert_eq!("STAFF".parse::<DataType>().unwrap(), DataType::Staff);
        assert!("coupons".parse::<DataType>().is_err());
    }

    #[test]
    fn test_sync_record_wire_names() {
        let record = SyncRecord {
            tenant_id: TenantId::new("t1").unwrap(),
            data_type: DataType::Settings,
            payload: serde_json::json!({"salonName": "Spa X"}),
            device_id: DeviceId::generate(),
            last_updated: Utc::now(),
            version: 3,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["tenant_id"], "t1");
        assert_eq!(value["data_type"], "settings");
        assert_eq!(value["data"]["salonName"], "Spa X");
        assert_eq!(value["version"], 3);
    }

    #[test]
    fn test_next_stamp_uses_clock_when_ahead() {
        let prev = Utc::now();
        let now = prev + Duration::seconds(1);
        assert_eq!(next_stamp(Some(prev), now), now);
        assert_eq!(next_stamp(None, now), now);
    }

    proptest! {
        #[test]
        fn prop_next_stamp_strictly_increases(skew in -5_000i64..5_000) {
            let prev = Utc::now();
            let now = prev + Duration::microseconds(skew);
            prop_assert!(next_stamp(Some(prev), now) > prev);
        }
    }
}
