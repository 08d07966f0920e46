use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use vaultpref_core::{RawStore, RawStoreError};

type Entries = BTreeMap<String, String>;

/// File-backed raw store: the whole map lives in one JSON document that is
/// replaced atomically (temp file + rename) on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileStore {
    /// Opens `path`, loading existing entries. A missing file is an empty store.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RawStoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = read_entries(&path)?;
        debug!(entries = entries.len(), "opened file store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, RawStoreError> {
        self.entries.lock().map_err(|err| RawStoreError::LockPoisoned {
            reason: err.to_string(),
        })
    }

    fn mutate<F>(&self, apply: F) -> Result<(), RawStoreError>
    where
        F: FnOnce(&mut Entries),
    {
        let mut entries = self.lock()?;
        let mut next = entries.clone();
        apply(&mut next);
        write_entries(&self.path, &next)?;
        *entries = next;
        Ok(())
    }
}

impl RawStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, RawStoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), RawStoreError> {
        if !self.contains(key)? {
            return Ok(());
        }
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn contains(&self, key: &str) -> Result<bool, RawStoreError> {
        Ok(self.lock()?.contains_key(key))
    }

    fn clear(&self) -> Result<(), RawStoreError> {
        self.mutate(BTreeMap::clear)
    }

    fn len(&self) -> Result<usize, RawStoreError> {
        Ok(self.lock()?.len())
    }
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), RawStoreError> {
    let parent = path.parent().ok_or_else(|| RawStoreError::Io {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let json = serde_json::to_vec(entries).map_err(serde_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn read_entries(path: &Path) -> Result<Entries, RawStoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(err) => return Err(io_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(io_err)?;
    if buf.is_empty() {
        return Ok(Entries::new());
    }
    serde_json::from_slice(&buf).map_err(serde_err)
}

fn io_err<E: ToString>(err: E) -> RawStoreError {
    RawStoreError::Io {
        reason: err.to_string(),
    }
}

fn serde_err<E: ToString>(err: E) -> RawStoreError {
    RawStoreError::Serialization {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cipher::AesGcmCipher,
        encrypted_store::EncryptedStore,
        hash::Sha256Hash,
        key_provider::{PasswordKey, Prf},
    };

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs").join("store.json");

        let store = FileStore::open(&path).expect("open");
        assert!(store.is_empty().expect("is_empty"));
        store.put("k", "v").expect("put");
        store.put("other", "value").expect("put");
        store.remove("other").expect("remove");
        drop(store);

        let reopened = FileStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("k").expect("get").as_deref(), Some("v"));
        assert!(!reopened.contains("other").expect("contains"));
        assert_eq!(reopened.len().expect("len"), 1);
    }

    #[test]
    fn clear_persists_empty_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path).expect("open");
        store.put("k", "v").expect("put");
        store.clear().expect("clear");

        let reopened = FileStore::open(&path).expect("reopen");
        assert!(reopened.is_empty().expect("is_empty"));
    }

    #[test]
    fn corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").expect("write");

        let err = FileStore::open(&path).expect_err("should fail");
        assert!(matches!(err, RawStoreError::Serialization { .. }));
    }

    #[test]
    fn encrypted_store_keeps_plaintext_off_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let open = || {
            EncryptedStore::open(
                "disk",
                FileStore::open(&path).expect("file store"),
                AesGcmCipher,
                Sha256Hash,
                PasswordKey::new("password", "salt", Prf::HmacSha256),
            )
            .expect("open")
        };

        open().put_string("editor/font-size", Some("hello-vault")).expect("put");

        let on_disk = fs::read_to_string(&path).expect("read");
        assert!(!on_disk.contains("hello-vault"), "plaintext must not be stored");
        assert!(!on_disk.contains("editor/font-size"), "logical key must not be stored");

        // same hash across two separate constructions
        assert_eq!(
            open().get_string("editor/font-size", None).expect("get").as_deref(),
            Some("hello-vault")
        );
    }
}
