//! Key/value storage scopes backing the session and dedup state.
//!
//! A storage scope is the persistence boundary the tracker relies on: it survives
//! remounts (and, for [`FileStorage`], process restarts), and is shared by every
//! surface built from the same [`crate::tracker::Tracker`]. Callers above this
//! module never let a [`StorageError`] escape; they fall back to memory instead.
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage contents are not valid json: {0}")]
    Corrupted(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("storage is unavailable")]
    Unavailable,
}

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Read-modify-write of one key, atomic against every other handle on the same
    /// scope. `apply` sees the current value and returns the value to store, or
    /// `None` to leave the key as it is.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<(), StorageError>;
}

/// A scope that lives as long as the value itself.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries()?.insert(key.to_owned(), value);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries()?;
        if let Some(value) = apply(entries.get(key).map(String::as_str)) {
            entries.insert(key.to_owned(), value);
        }
        Ok(())
    }
}

/// A scope persisted as a single JSON object on disk.
///
/// Nothing is cached: every operation reads the file, so any number of handles,
/// in this process or another, see one scope. Writes happen under an advisory lock
/// on a `.lock` sibling and replace the whole file through a `.tmp` sibling and a
/// rename, so readers never see a half-written file.
pub struct FileStorage {
    path: PathBuf,
    lock_file: Mutex<File>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(&path, ".lock"))?;

        let storage = Self {
            path,
            lock_file: Mutex::new(lock_file),
        };
        storage.read_entries()?;

        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<HashMap<String, String>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, serde_json::to_vec(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Exclusive hold on the scope: the mutex covers threads sharing this handle,
    /// the advisory lock covers every other handle.
    fn exclusive(&self) -> Result<ScopeLock<'_>, StorageError> {
        let file = self.lock_file.lock().map_err(|_| StorageError::Poisoned)?;
        FileExt::lock_exclusive(&*file)?;
        Ok(ScopeLock { file })
    }
}

struct ScopeLock<'a> {
    file: MutexGuard<'a, File>,
}

impl Drop for ScopeLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&*self.file) {
            warn!("failed to release storage lock: {}", e);
        }
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_entries()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut value = Some(value);
        self.update(key, &mut |_current: Option<&str>| value.take())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<(), StorageError> {
        let _scope = self.exclusive()?;
        let mut entries = self.read_entries()?;

        let Some(value) = apply(entries.get(key).map(String::as_str)) else {
            return Ok(());
        };
        if entries.get(key) == Some(&value) {
            return Ok(());
        }

        entries.insert(key.to_owned(), value);
        self.persist(&entries)
    }
}

/// `path` with `suffix` appended to its full file name, so `promo.json` and
/// `promo.db` never share a sibling.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// A scope that refuses every operation, like browser storage in a locked-down
/// private context.
#[derive(Clone, Copy, Default)]
pub struct UnavailableStorage;

impl Storage for UnavailableStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable)
    }

    fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    fn update(
        &self,
        _key: &str,
        _apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }
}
