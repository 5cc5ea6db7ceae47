//! Key-value store trait definition.

use tenantsync_common::Result;

/// Persistent string key-value store shared by every tab of a profile.
///
/// All operations are synchronous and local; values are serialized JSON.
/// Implementations must make a `set` visible to every subsequent `get`,
/// from any handle onto the same underlying storage.
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local", "sqlite").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// - Storage disabled or full
    /// - I/O errors
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// List all stored keys.
    fn keys(&self) -> Result<Vec<String>>;
}
