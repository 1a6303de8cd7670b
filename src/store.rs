//! Persistence for presets and sequences.
//!
//! Records are TOML text addressed by `(namespace, key)`. The core does not
//! care where they live; [`MemoryStore`] and [`FileStore`] are provided.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::StoreError;

/// Namespace holding preset positions.
pub const PRESETS: &str = "presets";

/// Namespace holding sequence definitions.
pub const SEQUENCES: &str = "sequences";

/// Namespace holding operator-adjusted settings.
pub const SETTINGS: &str = "settings";

/// Result type for store calls.
pub type StoreResult<T> = core::result::Result<T, StoreError>;

/// Key-value record interface.
pub trait RecordStore: Send + Sync {
    /// Read a record.
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>>;

    /// Create or replace a record.
    fn put(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    /// Keys in a namespace, sorted.
    fn keys(&self, namespace: &str) -> StoreResult<Vec<String>>;
}

/// Encode `value` as TOML and store it.
pub fn save_record<T: Serialize>(
    store: &dyn RecordStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let text = toml::to_string(value).map_err(|e| StoreError::Encode {
        key: key.into(),
        message: e.to_string(),
    })?;
    store.put(namespace, key, &text)
}

/// Load and decode a TOML record.
pub fn load_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    namespace: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    let Some(text) = store.get(namespace, key)? else {
        return Ok(None);
    };
    toml::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::Decode {
            key: key.into(),
            message: e.message().into(),
        })
}

/// Volatile store, for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(String, String), String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .records
            .read()
            .get(&(namespace.to_owned(), key.to_owned()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        self.records
            .write()
            .insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        Ok(self
            .records
            .write()
            .remove(&(namespace.to_owned(), key.to_owned()))
            .is_some())
    }

    fn keys(&self, namespace: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

/// One TOML file per record: `<root>/<namespace>/<key>.toml`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    const EXTENSION: &'static str = "toml";

    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_segment(segment: &str) -> StoreResult<()> {
        let bad = segment.is_empty()
            || segment.starts_with('.')
            || segment.contains(['/', '\\', '\0']);
        if bad {
            Err(StoreError::InvalidKey(segment.into()))
        } else {
            Ok(())
        }
    }

    fn record_path(&self, namespace: &str, key: &str) -> StoreResult<PathBuf> {
        Self::check_segment(namespace)?;
        Self::check_segment(key)?;
        Ok(self
            .root
            .join(namespace)
            .join(format!("{key}.{}", Self::EXTENSION)))
    }
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

impl RecordStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        let path = self.record_path(namespace, key)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        let path = self.record_path(namespace, key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_error)?;
        }

        // Write-then-rename so readers never see a torn record
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, value).map_err(io_error)?;
        fs::rename(&tmp, &path).map_err(io_error)?;
        debug!(namespace, key, "record written");
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let path = self.record_path(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }

    fn keys(&self, namespace: &str) -> StoreResult<Vec<String>> {
        Self::check_segment(namespace)?;
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(Self::EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
