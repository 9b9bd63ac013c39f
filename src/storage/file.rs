// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! File-backed keyed storage for native hosts.
//!
//! The whole key space lives in one JSON object on disk. Every mutation
//! rewrites the file through a temp file + rename so a crash never leaves a
//! half-written store behind. Intended for the small, string-valued key
//! spaces this crate produces, not as a general database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::traits::{StorageBackend, StorageError};

pub struct FileBackend {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl FileBackend {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_quota(path, None)
    }

    /// Open with a byte quota over `key.len() + value.len()` of all entries.
    pub fn open_with_quota(
        path: impl AsRef<Path>,
        quota_bytes: Option<usize>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), entries = data.len(), "Opened file storage backend");

        Ok(Self {
            path,
            data: Mutex::new(data),
            quota_bytes,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes_of(data: &BTreeMap<String, String>) -> usize {
        data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn persist(&self, data: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(data)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to replace storage file");
            StorageError::from(e)
        })?;
        debug!(path = %self.path.display(), entries = data.len(), "Storage file written");
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self.data.lock();

        if let Some(limit) = self.quota_bytes {
            let used = Self::bytes_of(&data);
            let old_size = data.get(key).map_or(0, |v| key.len() + v.len());
            let new_size = key.len() + value.len();
            if used - old_size + new_size > limit {
                return Err(StorageError::QuotaExceeded {
                    used,
                    requested: new_size,
                    limit,
                });
            }
        }

        let previous = data.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&data) {
            // Keep memory and disk in agreement
            match previous {
                Some(prev) => data.insert(key.to_string(), prev),
                None => data.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        if let Some(previous) = data.remove(key) {
            if let Err(e) = self.persist(&data) {
                data.insert(key.to_string(), previous);
                return Err(e);
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.lock().keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let empty = BTreeMap::new();
        self.persist(&empty)?;
        *data = empty;
        Ok(())
    }

    fn used_bytes(&self) -> Option<usize> {
        Some(Self::bytes_of(&self.data.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("store.json")).unwrap();

        backend.write("a", "1").unwrap();
        assert_eq!(backend.read("a").unwrap().as_deref(), Some("1"));

        backend.delete("a").unwrap();
        assert_eq!(backend.read("a").unwrap(), None);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.write("persist-1", "one").unwrap();
            backend.write("persist-2", "two").unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        let mut keys = backend.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["persist-1", "persist-2"]);
        assert_eq!(backend.read("persist-2").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_quota_exceeded() {
        let dir = tempdir().unwrap();
        let backend =
            FileBackend::open_with_quota(dir.path().join("small.json"), Some(8)).unwrap();

        backend.write("k", "123").unwrap();
        let err = backend.write("k2", "123456").unwrap_err();
        assert!(err.is_quota());
        assert_eq!(backend.read("k2").unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = FileBackend::open(&path);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }

    #[test]
    fn test_clear_empties_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let backend = FileBackend::open(&path).unwrap();
        backend.write("a", "1").unwrap();
        backend.clear().unwrap();
        assert!(backend.keys().unwrap().is_empty());

        let reopened = FileBackend::open(&path).unwrap();
        assert!(reopened.keys().unwrap().is_empty());
    }
}
