use std::{fmt, str::FromStr, sync::Arc};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use vaultpref_core::{RawStore, RawStoreError};

use crate::{
    cipher::{Cipher, CryptoError},
    hash::KeyHash,
    key_provider::{KeyError, KeyProvider},
};

/// Reserved logical key holding `"<cipherTag>:<hashTag>:<keyTag>"`.
pub const INTEGRITY_TAG_KEY: &str = "KEY_ENCRYPTION_TAG";

#[derive(Debug, Error)]
pub enum EncryptedStoreError {
    /// The store was written with another key, cipher or hash.
    #[error("store `{name}` uses a different encryption method or key (expected tag `{expected}`)")]
    TagMismatch { name: String, expected: String },
    #[error(transparent)]
    Raw(#[from] RawStoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("stored value for `{key}` is not a valid {target}")]
    Conversion { key: String, target: &'static str },
}

/// String store that hashes keys and encrypts values on top of a [`RawStore`].
///
/// Every entry lives under `hash(logical_key)` with value
/// `cipher.encrypt(key, plaintext)`. Opening a non-empty raw store checks the
/// integrity tag and fails before any plaintext is returned when it does not
/// match the supplied strategies.
pub struct EncryptedStore {
    name: String,
    raw: Arc<dyn RawStore>,
    cipher: Box<dyn Cipher>,
    hash: Box<dyn KeyHash>,
    key: Box<dyn KeyProvider>,
}

impl EncryptedStore {
    pub fn open(
        name: impl Into<String>,
        raw: impl RawStore + 'static,
        cipher: impl Cipher + 'static,
        hash: impl KeyHash + 'static,
        key: impl KeyProvider + 'static,
    ) -> Result<Self, EncryptedStoreError> {
        let store = Self {
            name: name.into(),
            raw: Arc::new(raw),
            cipher: Box::new(cipher),
            hash: Box::new(hash),
            key: Box::new(key),
        };
        store.check_tag()?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"<cipherTag>:<hashTag>:<keyTag>"` for the strategies this store was opened with.
    pub fn integrity_tag(&self) -> String {
        format!(
            "{}:{}:{}",
            self.cipher.tag(),
            self.hash.tag(),
            self.key.tag()
        )
    }

    /// Key under which `key` is persisted in the raw store.
    pub fn storage_key(&self, key: &str) -> String {
        self.hash.hash(key)
    }

    #[instrument(skip_all, fields(store = %self.name))]
    pub fn get_string(
        &self,
        key: &str,
        default: Option<&str>,
    ) -> Result<Option<String>, EncryptedStoreError> {
        match self.raw.get(&self.storage_key(key))? {
            Some(sealed) => {
                let material = self.key.derive()?;
                Ok(Some(self.cipher.decrypt(&material, &sealed)?))
            }
            None => Ok(default.map(str::to_string)),
        }
    }

    /// Encrypts and stores `value`; `None` removes the entry.
    #[instrument(skip_all, fields(store = %self.name))]
    pub fn put_string(&self, key: &str, value: Option<&str>) -> Result<(), EncryptedStoreError> {
        let Some(value) = value else {
            return self.remove(key);
        };
        let material = self.key.derive()?;
        let sealed = self.cipher.encrypt(&material, value)?;
        self.raw.put(&self.storage_key(key), &sealed)?;
        Ok(())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, EncryptedStoreError> {
        self.get_parsed(key, default, "bool")
    }

    pub fn get_int(&self, key: &str, default: i32) -> Result<i32, EncryptedStoreError> {
        self.get_parsed(key, default, "i32")
    }

    pub fn get_long(&self, key: &str, default: i64) -> Result<i64, EncryptedStoreError> {
        self.get_parsed(key, default, "i64")
    }

    pub fn put_bool(&self, key: &str, value: Option<bool>) -> Result<(), EncryptedStoreError> {
        self.put_string(key, value.map(|v| v.to_string()).as_deref())
    }

    pub fn put_int(&self, key: &str, value: Option<i32>) -> Result<(), EncryptedStoreError> {
        self.put_string(key, value.map(|v| v.to_string()).as_deref())
    }

    pub fn put_long(&self, key: &str, value: Option<i64>) -> Result<(), EncryptedStoreError> {
        self.put_string(key, value.map(|v| v.to_string()).as_deref())
    }

    #[instrument(skip_all, fields(store = %self.name))]
    pub fn remove(&self, key: &str) -> Result<(), EncryptedStoreError> {
        self.raw.remove(&self.storage_key(key))?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool, EncryptedStoreError> {
        Ok(self.raw.contains(&self.storage_key(key))?)
    }

    /// Empties the raw store and writes a fresh integrity tag.
    #[instrument(skip_all, fields(store = %self.name))]
    pub fn clear(&self) -> Result<(), EncryptedStoreError> {
        self.raw.clear()?;
        debug!("cleared store");
        self.seed_tag()
    }

    fn get_parsed<T: FromStr>(
        &self,
        key: &str,
        default: T,
        target: &'static str,
    ) -> Result<T, EncryptedStoreError> {
        match self.get_string(key, None)? {
            Some(raw) => raw.parse().map_err(|_| EncryptedStoreError::Conversion {
                key: key.to_string(),
                target,
            }),
            None => Ok(default),
        }
    }

    fn seed_tag(&self) -> Result<(), EncryptedStoreError> {
        debug!(store = %self.name, "seeding integrity tag");
        self.put_string(INTEGRITY_TAG_KEY, Some(&self.integrity_tag()))
    }

    fn check_tag(&self) -> Result<(), EncryptedStoreError> {
        if self.raw.is_empty()? {
            return self.seed_tag();
        }

        let expected = self.integrity_tag();
        let found = match self.get_string(INTEGRITY_TAG_KEY, None) {
            Ok(found) => found,
            // a wrong key surfaces as a decryption failure of the tag itself
            Err(EncryptedStoreError::Crypto(err)) => {
                debug!(store = %self.name, %err, "integrity tag did not decrypt");
                None
            }
            Err(err) => return Err(err),
        };

        if found.as_deref() == Some(expected.as_str()) {
            return Ok(());
        }

        warn!(store = %self.name, "integrity tag mismatch");
        Err(EncryptedStoreError::TagMismatch {
            name: self.name.clone(),
            expected,
        })
    }
}

impl fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("name", &self.name)
            .field("tag", &self.integrity_tag())
            .finish_non_exhaustive()
    }
}
