//! Durable key-value storage backing the session store

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::{CoreError, CoreResult};

/// Durable key under which the access token is kept
pub const TOKEN_KEY: &str = "token";
/// Durable key under which the refresh token is kept
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Durable key under which the serialized user profile is kept
pub const USER_KEY: &str = "user";
/// Durable key under which the program type is kept
pub const PROGRAM_TYPE_KEY: &str = "programType";

/// Every key owned by the session store
pub const SESSION_KEYS: [&str; 4] = [TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY, PROGRAM_TYPE_KEY];

/// Synchronous key-value surface.
///
/// `apply` writes a batch of changes as one step: a reader on the same
/// storage sees either none or all of them. `None` removes the key.
pub trait DurableStorage: Send + Sync {
    fn get(&self, key: &str) -> CoreResult<Option<String>>;

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> CoreResult<()>;

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        self.apply(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.apply(&[(key, None)])
    }

    fn remove_many(&self, keys: &[&str]) -> CoreResult<()> {
        let changes: Vec<(&str, Option<&str>)> = keys.iter().map(|key| (*key, None)).collect();
        self.apply(&changes)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local storage. Share one instance through an `Arc` to let several
/// session stores observe each other like browser tabs do.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> CoreResult<()> {
        let mut entries = lock(&self.entries);
        for (key, value) in changes {
            match value {
                Some(value) => {
                    entries.insert((*key).to_string(), (*value).to_string());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// Storage persisted as a single JSON object on disk.
///
/// The file is re-read on every access so changes made by another process
/// are picked up. Writes land in a sibling temp file that is renamed over the
/// original. A file that no longer parses reads as empty, so the client
/// starts signed out and the next write replaces it.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Default file name inside the storage directory
    pub const FILE_NAME: &'static str = "session.json";

    /// Open (or lazily create) the session file inside `dir`
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            CoreError::storage(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let path = dir.join(Self::FILE_NAME);
        debug!(path = %path.display(), "Opened session file storage");

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> CoreResult<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    warn!(path = %self.path.display(), "Ignoring unreadable session file: {e}");
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CoreError::storage(format!(
                "Failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> CoreResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp, content)
            .map_err(|e| CoreError::storage(format!("Failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            CoreError::storage(format!("Failed to replace {}: {e}", self.path.display()))
        })
    }
}

impl DurableStorage for FileStorage {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> CoreResult<()> {
        let _guard = lock(&self.write_lock);
        let mut entries = self.read_all()?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    entries.insert((*key).to_string(), (*value).to_string());
                }
                None => {
                    entries.remove(*key);
                }
            }
        }
        self.write_all(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_set_get_remove() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);

        storage.set(TOKEN_KEY, "abc").unwrap();
        assert_eq!(storage.get(TOKEN_KEY).unwrap().as_deref(), Some("abc"));

        storage.remove(TOKEN_KEY).unwrap();
        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_memory_storage_batch() {
        let storage = MemoryStorage::new();
        storage
            .apply(&[(TOKEN_KEY, Some("a")), (REFRESH_TOKEN_KEY, Some("r"))])
            .unwrap();
        assert_eq!(storage.len(), 2);

        storage.remove_many(&SESSION_KEYS).unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let storage = FileStorage::open(dir.path()).unwrap();
        storage
            .apply(&[(TOKEN_KEY, Some("a")), (USER_KEY, Some("{\"id\":\"1\"}"))])
            .unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.get(TOKEN_KEY).unwrap().as_deref(), Some("a"));
        assert_eq!(
            reopened.get(USER_KEY).unwrap().as_deref(),
            Some("{\"id\":\"1\"}")
        );

        // A write through one handle is visible through the other
        reopened.remove(TOKEN_KEY).unwrap();
        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);
        assert!(!dir.path().join("session.json.tmp").exists());
    }

    #[test]
    fn test_file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).unwrap();
        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);
        storage.remove_many(&SESSION_KEYS).unwrap();
    }

    #[test]
    fn test_file_storage_reads_corrupt_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        fs::write(storage.path(), "{\"token\": \"trunc").unwrap();

        assert_eq!(storage.get(TOKEN_KEY).unwrap(), None);

        storage.set(TOKEN_KEY, "fresh").unwrap();
        let content = fs::read_to_string(storage.path()).unwrap();
        let entries: BTreeMap<String, String> = serde_json::from_str(&content).unwrap();
        assert_eq!(entries.get(TOKEN_KEY).map(String::as_str), Some("fresh"));
    }
}
