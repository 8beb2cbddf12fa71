//! Durable tier of the session store.
//!
//! One JSON file holds a mapping of normalized repository path to session
//! record. Every read-modify-write cycle runs under an exclusive `fs2`
//! lock on a sidecar file, so concurrent processes serialize on the store
//! rather than clobbering each other, and the data file itself is replaced
//! atomically (write temp, then rename).

use anyhow::{Context, Result};
use fs2::FileExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Raw JSON mapping as stored on disk.
pub type DiskMap = BTreeMap<String, Value>;

/// File-backed session records.
#[derive(Debug, Clone)]
pub struct SessionDisk {
    path: PathBuf,
}

/// Guard holding the sidecar lock for one read-modify-write cycle.
struct DiskLock {
    _file: File,
}

impl SessionDisk {
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default store location: `<data_dir>/teapot/sessions.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("teapot")
            .join("sessions.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<DiskLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create session store directory")?;
        }
        let lock_path = self.path.with_extension("json.lock");
        let file = File::create(&lock_path).context("Failed to create session store lock file")?;
        file.lock_exclusive()
            .context("Failed to acquire exclusive lock on session store")?;
        Ok(DiskLock { _file: file })
    }

    fn read_map(&self) -> Result<DiskMap> {
        if !self.path.exists() {
            return Ok(DiskMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session store at {:?}", self.path))?;
        if raw.trim().is_empty() {
            return Ok(DiskMap::new());
        }
        serde_json::from_str(&raw).with_context(|| {
            format!(
                "Session store file is corrupted. To recover, delete the file:\n  rm {:?}",
                self.path
            )
        })
    }

    fn write_map(&self, map: &DiskMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create session store directory")?;
        }
        let content = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content.as_bytes())
            .with_context(|| format!("Failed to write session store at {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace session store at {:?}", self.path))?;
        Ok(())
    }

    /// Read one record's raw JSON. A corrupted top-level file is an error;
    /// per-record schema problems are the caller's to judge.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let _lock = self.lock()?;
        Ok(self.read_map()?.get(key).cloned())
    }

    /// Read every record's raw JSON.
    pub fn load_all(&self) -> Result<DiskMap> {
        let _lock = self.lock()?;
        self.read_map()
    }

    pub fn put(&self, key: &str, value: Value) -> Result<()> {
        let _lock = self.lock()?;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value);
        self.write_map(&map)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    /// Drop everything, leaving an empty mapping behind.
    pub fn clear_all(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.write_map(&DiskMap::new())
    }
}
