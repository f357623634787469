//! Persistence of signer key material.
//!
//! Stores deal in opaque bytes, one record per keep. Deleting a record
//! archives it rather than destroying it.
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chain::Address;

const CURRENT_DIR: &str = "current";
const ARCHIVE_DIR: &str = "archive";
const EXTENSION: &str = "signer";

/// Represents an error when accessing a key store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key store refused the write")]
    WriteRefused,
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub keep: Address,
    pub data: Vec<u8>,
}

/// Durable storage for the key material of every keep.
pub trait KeyStore: Send + Sync {
    /// Save the data of a keep, replacing what was there.
    fn save(&self, keep: Address, data: &[u8]) -> Result<(), StorageError>;

    /// List the current records.
    ///
    /// Records which can't be read at all are left out.
    fn list(&self) -> Result<Vec<PersistedRecord>, StorageError>;

    /// Archive the record of a keep. Deleting a missing record is not an error.
    fn delete(&self, keep: Address) -> Result<(), StorageError>;
}

/// A key store keeping one file per keep in a directory.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    current: PathBuf,
    archive: PathBuf,
}

impl FileKeyStore {
    /// Open a store in a directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        let current = dir.join(CURRENT_DIR);
        let archive = dir.join(ARCHIVE_DIR);
        for path in [&current, &archive] {
            fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))?;
        }
        Ok(Self { current, archive })
    }

    fn file_name(keep: Address) -> String {
        format!("{}.{}", hex::encode(keep.as_bytes()), EXTENSION)
    }

    fn parse_file_name(path: &Path) -> Option<Address> {
        if path.extension()? != EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    /// The addresses of keeps whose records have been archived.
    pub fn archived(&self) -> Result<Vec<Address>, StorageError> {
        let entries = fs::read_dir(&self.archive).map_err(|e| StorageError::io(&self.archive, e))?;
        let mut out: Vec<Address> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| Self::parse_file_name(&entry.path()))
            .collect();
        out.sort();
        Ok(out)
    }
}

impl KeyStore for FileKeyStore {
    fn save(&self, keep: Address, data: &[u8]) -> Result<(), StorageError> {
        let path = self.current.join(Self::file_name(keep));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;
        debug!(keep = %keep, path = %path.display(), "saved signer");
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersistedRecord>, StorageError> {
        let entries = fs::read_dir(&self.current).map_err(|e| StorageError::io(&self.current, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "failed to read key store entry");
                    continue;
                }
            };
            let Some(keep) = Self::parse_file_name(&path) else {
                debug!(path = %path.display(), "ignoring unknown file");
                continue;
            };
            match fs::read(&path) {
                Ok(data) => out.push(PersistedRecord { keep, data }),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read signer"),
            }
        }
        out.sort_by_key(|r| r.keep);
        Ok(out)
    }

    fn delete(&self, keep: Address) -> Result<(), StorageError> {
        let name = Self::file_name(keep);
        let from = self.current.join(&name);
        let to = self.archive.join(&name);
        match fs::rename(&from, &to) {
            Ok(()) => {
                debug!(keep = %keep, "archived signer");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&from, e)),
        }
    }
}

/// A key store living in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    current: Mutex<BTreeMap<Address, Vec<u8>>>,
    archive: Mutex<BTreeMap<Address, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save and delete fail, or work again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn archived(&self) -> Vec<Address> {
        self.archive.lock().keys().copied().collect()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRefused);
        }
        Ok(())
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, keep: Address, data: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.current.lock().insert(keep, data.to_vec());
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersistedRecord>, StorageError> {
        Ok(self
            .current
            .lock()
            .iter()
            .map(|(keep, data)| PersistedRecord {
                keep: *keep,
                data: data.clone(),
            })
            .collect())
    }

    fn delete(&self, keep: Address) -> Result<(), StorageError> {
        self.check_writable()?;
        if let Some(data) = self.current.lock().remove(&keep) {
            self.archive.lock().insert(keep, data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keep(x: u8) -> Address {
        Address::from([x; 20])
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();

        store.save(keep(1), b"one").unwrap();
        store.save(keep(2), b"two").unwrap();
        store.save(keep(1), b"uno").unwrap();
        fs::write(dir.path().join(CURRENT_DIR).join("notes.txt"), b"hi").unwrap();

        let records = store.list().unwrap();
        assert_eq!(
            records,
            vec![
                PersistedRecord {
                    keep: keep(1),
                    data: b"uno".to_vec()
                },
                PersistedRecord {
                    keep: keep(2),
                    data: b"two".to_vec()
                },
            ]
        );

        store.delete(keep(1)).unwrap();
        store.delete(keep(1)).unwrap();
        store.delete(keep(3)).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.archived().unwrap(), vec![keep(1)]);

        // A fresh handle on the same directory sees the same state.
        let reopened = FileKeyStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list().unwrap()[0].keep, keep(2));
    }

    #[test]
    fn test_memory_store_refuses_writes() {
        let store = MemoryKeyStore::new();
        store.save(keep(1), b"one").unwrap();
        store.fail_writes(true);
        assert!(store.save(keep(2), b"two").is_err());
        assert!(store.delete(keep(1)).is_err());
        assert_eq!(store.list().unwrap().len(), 1);

        store.fail_writes(false);
        store.delete(keep(1)).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.archived(), vec![keep(1)]);
    }
}
