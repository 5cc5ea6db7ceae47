//! Local filesystem key-value store.

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use tenantsync_common::{Error, Result};

use crate::provider::KeyValueStore;

/// Extension of every value file.
const VALUE_EXT: &str = "json";

/// Filesystem store.
///
/// Stores one file per key in a flat directory. Key names are
/// percent-encoded so tenant separators never reach the filesystem.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Store root is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.root.join(format!("{}.{}", encoded, VALUE_EXT))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(&format!(".{}", VALUE_EXT))?;
        percent_decode_str(encoded)
            .decode_utf8()
            .ok()
            .map(|k| k.into_owned())
    }
}

impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "local"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        // Write then rename so readers never observe a half-written value.
        // Each write gets its own temp file; handles share the directory.
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, value)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Self::key_from_file_name(name) {
                Some(key) => keys.push(key),
                None if name.ends_with(".tmp") => {}
                None => warn!("Ignoring foreign file in store root: {}", name),
            }
        }
        Ok(keys)
    }
}
