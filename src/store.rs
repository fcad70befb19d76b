//! Persistence port: the key/value contract the engine writes its
//! materialized views through, plus file-backed and in-memory providers.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Key/value persistence contract. Values are opaque serialized records;
/// serialization is the caller's concern (see [`get`] / [`set`]).
///
/// Keys used by the engine: `seen.<id>`, `timeline`, `messages.<pubkey>`,
/// `conversations`, `follows`, `profile`, `profiles`, `relays`.
pub trait Store: Send + Sync {
    /// Fetch the raw record stored under `key`, if present.
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`, overwriting any previous record.
    fn set_raw(&self, key: &str, value: &str) -> Result<()>;
    /// Whether any record exists under `key`.
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(key)?.is_some())
    }
}

/// Fetch and deserialize a typed record.
pub fn get<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    match store.get_raw(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a typed record.
pub fn set<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    store.set_raw(key, &serde_json::to_string(value)?)
}

/// File-per-record store rooted at a directory. Records are written
/// atomically: serialized to a temporary file in the same directory, then
/// persisted over the final path.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<FileStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStore { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl Store for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), value)?;
        tmp.persist(&path)
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.path(key).exists())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl Store for MemStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
