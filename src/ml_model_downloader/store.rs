//! Persistent key-value storage for local model info.
//!
//! Each model is stored as independent entries under a
//! `{bundle_id}.{app_name}.{model_name}` prefix. Writes for one model go through
//! a single batch so readers never see half of an update.

use crate::ml_model_downloader::models::LocalModelInfo;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set_values(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;
    fn remove_values(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set_values(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.extend(entries);
        Ok(())
    }

    fn remove_values(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Every downloader of the process that persists to the same file must go
/// through one instance, see `FileStore::shared`. Separate instances on one
/// file overwrite each other's entries.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

static SHARED_FILE_STORES: OnceLock<Mutex<HashMap<PathBuf, Arc<FileStore>>>> = OnceLock::new();
static FLUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Map::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// The process-wide store for `path`, opened on first use.
    pub fn shared(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let key = std::path::absolute(&path).unwrap_or_else(|_| path.clone());
        let mut stores = SHARED_FILE_STORES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .map_err(|_| StoreError::Poisoned)?;
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }
        let store = Arc::new(Self::open(path)?);
        stores.insert(key, store.clone());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `values` to a uniquely named sibling file, then renames it over the store.
    fn flush(&self, values: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension(format!(
            "json.{}.{}.tmp",
            std::process::id(),
            FLUSH_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)
            .and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Applies `change` to a copy of the entries and keeps it only once it is on disk.
    fn update(&self, change: impl FnOnce(&mut Map<String, Value>)) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = values.clone();
        change(&mut next);
        self.flush(&next)?;
        *values = next;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set_values(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.update(|values| values.extend(entries))
    }

    fn remove_values(&self, keys: &[String]) -> Result<(), StoreError> {
        self.update(|values| {
            for key in keys {
                values.remove(key);
            }
        })
    }
}

const DOWNLOAD_URL_KEY: &str = "model-download-url";
const HASH_KEY: &str = "model-hash";
const SIZE_KEY: &str = "model-size";
const PATH_KEY: &str = "model-path";

/// Scope of persisted model info: one app of one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreScope {
    pub bundle_id: String,
    pub app_name: String,
}

impl StoreScope {
    pub fn new(bundle_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            app_name: app_name.into(),
        }
    }

    fn key(&self, model_name: &str, field: &str) -> String {
        format!("{}.{}.{}.{}", self.bundle_id, self.app_name, model_name, field)
    }

    fn keys(&self, model_name: &str) -> Vec<String> {
        [DOWNLOAD_URL_KEY, HASH_KEY, SIZE_KEY, PATH_KEY]
            .iter()
            .map(|field| self.key(model_name, field))
            .collect()
    }

    /// Reads model info back; any missing entry means there is no local model.
    pub fn read(&self, store: &dyn KeyValueStore, model_name: &str) -> Option<LocalModelInfo> {
        let string_value = |field: &str| {
            store
                .get(&self.key(model_name, field))
                .and_then(|v| v.as_str().map(str::to_string))
        };
        let download_url = string_value(DOWNLOAD_URL_KEY)?;
        let model_hash = string_value(HASH_KEY)?;
        let path = string_value(PATH_KEY)?;
        let size = store.get(&self.key(model_name, SIZE_KEY))?.as_u64()?;

        Some(LocalModelInfo {
            name: model_name.to_string(),
            download_url,
            model_hash,
            size,
            path: PathBuf::from(path),
        })
    }

    /// Writes or overwrites every entry for the model in one batch.
    pub fn write(&self, store: &dyn KeyValueStore, info: &LocalModelInfo) -> Result<(), StoreError> {
        store.set_values(vec![
            (self.key(&info.name, DOWNLOAD_URL_KEY), Value::from(info.download_url.clone())),
            (self.key(&info.name, HASH_KEY), Value::from(info.model_hash.clone())),
            (self.key(&info.name, SIZE_KEY), Value::from(info.size)),
            (
                self.key(&info.name, PATH_KEY),
                Value::from(info.path.to_string_lossy().into_owned()),
            ),
        ])
    }

    pub fn remove(&self, store: &dyn KeyValueStore, model_name: &str) -> Result<(), StoreError> {
        store.remove_values(&self.keys(model_name))
    }
}
