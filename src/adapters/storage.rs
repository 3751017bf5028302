//! Storage adapters.
//!
//! Both implement [`StoragePort`] and [`ConfigPort`]:
//!
//! - [`FileStorage`]: one file per key under `<root>/<namespace>/`.  Writes
//!   go to a temp file that is fsynced and renamed over the target, so a
//!   reader (or a crash) sees either the old value or the new one.
//! - [`MemoryStorage`]: shared in-memory map for tests and simulation.
//!
//! Configuration is kept as pretty-printed JSON under `config/engine.json`
//! so it stays hand-editable; it is validated on load and before saving.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

use crate::app::ports::{ConfigError, ConfigPort, StorageError, StoragePort};
use crate::config::{EngineConfig, validate_config};

const CONFIG_NAMESPACE: &str = "config";
const CONFIG_KEY: &str = "engine.json";
const TEMP_SUFFIX: &str = ".tmp";

fn check_segment(segment: &str) -> Result<(), StorageError> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::IoError)
    }
}

fn load_config(storage: &impl StoragePort) -> Result<EngineConfig, ConfigError> {
    let bytes = match storage.read(CONFIG_NAMESPACE, CONFIG_KEY) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound) => {
            info!("Config: none stored, using defaults");
            return Ok(EngineConfig::default());
        }
        Err(_) => return Err(ConfigError::IoError),
    };
    let config: EngineConfig =
        serde_json::from_slice(&bytes).map_err(|_| ConfigError::Corrupted)?;
    validate_config(&config)?;
    Ok(config)
}

fn encode_config(config: &EngineConfig) -> Result<Vec<u8>, ConfigError> {
    validate_config(config)?;
    serde_json::to_vec_pretty(config).map_err(|_| ConfigError::IoError)
}

// ── File-backed storage ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Use `root` as the data directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("FileStorage: data directory {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        check_segment(namespace)?;
        check_segment(key)?;
        Ok(self.root.join(namespace).join(key))
    }

    fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)
    }
}

impl StoragePort for FileStorage {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.path(namespace, key)?)?)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;
        Self::write_atomic(&path, data).map_err(|e| {
            warn!("FileStorage: write {} failed: {}", path.display(), e);
            StorageError::from(e)
        })
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(namespace, key)?) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.path(namespace, key).is_ok_and(|p| p.is_file())
    }
}

impl ConfigPort for FileStorage {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        load_config(self)
    }

    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        let bytes = encode_config(config)?;
        let path = self
            .path(CONFIG_NAMESPACE, CONFIG_KEY)
            .map_err(|_| ConfigError::IoError)?;
        Self::write_atomic(&path, &bytes).map_err(|_| ConfigError::IoError)?;
        info!("Config: saved to {}", path.display());
        Ok(())
    }
}

// ── In-memory storage ────────────────────────────────────────

/// Clones share one map, so a test can keep a handle while the datastore
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise failure paths.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::IoError);
        }
        self.map()
            .insert(Self::composite_key(namespace, key), data.to_vec());
        Ok(())
    }
}

impl StoragePort for MemoryStorage {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.map()
            .get(&Self::composite_key(namespace, key))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.put(namespace, key, data)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.map().remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.map()
            .contains_key(&Self::composite_key(namespace, key))
    }
}

impl ConfigPort for MemoryStorage {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        load_config(self)
    }

    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        let bytes = encode_config(config)?;
        self.put(CONFIG_NAMESPACE, CONFIG_KEY, &bytes)
            .map_err(|_| ConfigError::IoError)
    }
}
