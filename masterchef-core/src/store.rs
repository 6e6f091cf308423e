//! Generic keyed record store with optional JSON snapshot persistence.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::state::{read_json, write_json_atomic};

/// Anything the query facade can materialise as a list of JSON mappings.
pub trait RecordSource: Send + Sync {
    fn list_records(&self) -> Vec<Map<String, Value>>;
}

/// Records keyed by string id, kept in key order.
///
/// When opened with a snapshot path every mutation rewrites the snapshot
/// atomically while the write lock is held, so the file always reflects a
/// state some reader could have observed.
pub struct KeyedStore<T> {
    name: &'static str,
    records: RwLock<BTreeMap<String, T>>,
    snapshot: Option<PathBuf>,
}

impl<T> fmt::Debug for KeyedStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("KeyedStore");
        debug.field("name", &self.name);
        if let Some(records) = self.records.try_read() {
            debug.field("len", &records.len());
        }
        debug.field("snapshot", &self.snapshot).finish()
    }
}

impl<T> KeyedStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            records: RwLock::new(BTreeMap::new()),
            snapshot: None,
        }
    }

    /// Opens a store backed by `path`, loading an existing snapshot.
    pub fn persistent(name: &'static str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records: BTreeMap<String, T> = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            name,
            records: RwLock::new(records),
            snapshot: Some(path),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn insert(&self, key: impl Into<String>, value: T) -> Result<Option<T>> {
        let mut records = self.records.write();
        let previous = records.insert(key.into(), value);
        self.persist(&records)?;
        Ok(previous)
    }

    /// Applies `edit` to the record under `key`; `None` when it is missing.
    pub fn update<R>(&self, key: &str, edit: impl FnOnce(&mut T) -> R) -> Result<Option<R>> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(key) else {
            return Ok(None);
        };
        let out = edit(record);
        self.persist(&records)?;
        Ok(Some(out))
    }

    pub fn remove(&self, key: &str) -> Result<Option<T>> {
        let mut records = self.records.write();
        let removed = records.remove(key);
        if removed.is_some() {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.records.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Values in key order.
    pub fn values(&self) -> Vec<T> {
        self.records.read().values().cloned().collect()
    }

    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.records.read().values().find(|v| predicate(v)).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, records: &BTreeMap<String, T>) -> Result<()> {
        match &self.snapshot {
            Some(path) => write_json_atomic(path, records),
            None => Ok(()),
        }
    }
}

impl<T> RecordSource for KeyedStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn list_records(&self) -> Vec<Map<String, Value>> {
        self.records
            .read()
            .iter()
            .map(|(key, value)| match serde_json::to_value(value) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    let mut map = Map::new();
                    map.insert("key".into(), Value::String(key.clone()));
                    map.insert("value".into(), other);
                    map
                }
                Err(_) => Map::new(),
            })
            .collect()
    }
}
