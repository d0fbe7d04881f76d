//! Persistent cache configuration records.

use crate::config::CacheOptions;
use fc_error::{FcError, Result};
use fc_types::{CacheMode, PolicyKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Everything needed to recreate a cache binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub name: String,
    pub source_path: String,
    pub cache_path: String,
    pub mode: CacheMode,
    pub policy: PolicyKind,
    pub block_sectors: u32,
    pub options: CacheOptions,
    /// Forced read-only by a reboot quiesce.
    #[serde(default)]
    pub read_only: bool,
}

/// Where cache records are persisted.
pub trait MetadataStore: Send + Sync {
    fn persist(&self, record: &CacheRecord) -> Result<()>;
    fn load(&self, name: &str) -> Result<Option<CacheRecord>>;
    fn load_all(&self) -> Result<Vec<CacheRecord>>;
    fn remove(&self, name: &str) -> Result<()>;
}

/// In-memory store. Persist failures can be injected.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<BTreeMap<String, CacheRecord>>,
    failures: AtomicUsize,
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` persists fail.
    pub fn fail_next_persists(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn persist(&self, record: &CacheRecord) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FcError::Metadata(format!(
                "injected persist failure for {}",
                record.name
            )));
        }
        self.records
            .lock()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<CacheRecord>> {
        Ok(self.records.lock().get(name).cloned())
    }

    fn load_all(&self) -> Result<Vec<CacheRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.records.lock().remove(name);
        Ok(())
    }
}

/// One `<name>.json` file per cache in a directory.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    dir: PathBuf,
}

impl JsonMetadataStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(FcError::InvalidArgument(format!(
                "cache name {name:?} cannot be stored as a file"
            )));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn persist(&self, record: &CacheRecord) -> Result<()> {
        let path = self.path_for(&record.name)?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| FcError::Metadata(format!("encode {}: {e}", record.name)))?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(target: "fc::metadata", name = %record.name, path = %path.display(), "record_persisted");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<CacheRecord>> {
        let path = self.path_for(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FcError::Metadata(format!("decode {}: {e}", path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn load_all(&self) -> Result<Vec<CacheRecord>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let file = entry.file_name().into_string().ok()?;
                file.strip_suffix(".json").map(str::to_owned)
            })
            .collect();
        names.sort();
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.load(&name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(name)?) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
