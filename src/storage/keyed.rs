//! Durable keyed record store.
//!
//! One JSON file per key, named by the hex encoding of the key. Each key has
//! its own slot mutex: writers of different keys never wait on each other,
//! writers of the same key serialize. A write reaches disk before it becomes
//! visible in memory, so a failed durable write changes nothing.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::snapshot::{read_json, write_json_atomic};
use super::StoreError;

const RECORD_EXTENSION: &str = "json";

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Keyed store with per-key serialization and optional file persistence.
#[derive(Debug)]
pub struct KeyedStore<T> {
    label: &'static str,
    dir: Option<PathBuf>,
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T> KeyedStore<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Purely in-memory store (used by tests and ephemeral engines).
    pub fn in_memory(label: &'static str) -> Self {
        Self {
            label,
            dir: None,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Open a durable store rooted at `dir`, loading every existing record.
    ///
    /// A missing directory is created; an empty directory is a valid store.
    pub fn open(label: &'static str, dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut slots = HashMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let key = key_from_path(&path)?;
            if let Some(record) = read_json::<T>(&path)? {
                slots.insert(key, Arc::new(Mutex::new(Some(record))));
            }
        }

        log::info!(
            "STORE_OPENED store={} dir={} records={}",
            label,
            dir.display(),
            slots.len()
        );

        Ok(Self {
            label,
            dir: Some(dir),
            slots: RwLock::new(slots),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_durable(&self) -> bool {
        self.dir.is_some()
    }

    /// Number of keys holding a record.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current record for `key`.
    pub fn get(&self, key: &str) -> Option<T> {
        let slot = self.slots.read().get(key).cloned()?;
        let value = slot.lock().clone();
        value
    }

    /// Replace the whole record for `key`.
    pub fn put(&self, key: &str, value: T) -> Result<(), StoreError> {
        self.update(key, |_| Some(value)).map(|_| ())
    }

    /// Read-modify-write under the key's lock.
    ///
    /// `f` sees the current record and returns the replacement, or `None` to
    /// leave the record untouched. Returns the record as stored afterwards.
    pub fn update<F>(&self, key: &str, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let slot = self.slot(key);
        let mut current = slot.lock();

        let Some(next) = f(current.as_ref()) else {
            return Ok(current.clone());
        };

        if let Some(dir) = &self.dir {
            write_json_atomic(&record_path(dir, key), &next)?;
        }
        *current = Some(next);

        log::debug!("STORE_PUT store={} key={}", self.label, key);
        Ok(current.clone())
    }

    /// Flat, sorted copy of every record.
    ///
    /// Each record is read under its own lock, so the snapshot never holds a
    /// half-applied write.
    pub fn snapshot(&self) -> BTreeMap<String, T> {
        let slots: Vec<(String, Slot<T>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let value = slot.lock().clone();
                value.map(|v| (key, v))
            })
            .collect()
    }

    fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }
}

fn record_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", hex::encode(key.as_bytes()), RECORD_EXTENSION))
}

fn key_from_path(path: &Path) -> Result<String, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| corrupt("non UTF-8 file name".to_string()))?;
    let bytes = hex::decode(stem).map_err(|e| corrupt(format!("file name is not hex: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| corrupt(format!("key is not UTF-8: {}", e)))
}
