use std::{fmt, sync::Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;
use vaultpref_core::RawStore;
use zeroize::Zeroizing;

use crate::{
    cipher::AesGcmCipher,
    encrypted_store::{EncryptedStore, EncryptedStoreError},
    hash::Sha512Hash,
    key_provider::{
        random_bytes, EncryptionKey, KeyError, KeyProvider, KeychainKey, PasswordKey, Prf,
        SecretVault,
    },
};

const TAG: &str = "HybridKey";
const SECRET_LEN: usize = 256;

type Secret = Zeroizing<Vec<u8>>;

/// Password-based key whose password and salt are random, generated on first
/// use and kept in a private store sealed by a platform key.
///
/// Derivation runs at most once per instance: the first caller checks the
/// private store, generates and persists the secrets if they are missing, then
/// derives. Concurrent callers wait on the same lock and reuse the result.
pub struct HybridKey {
    pass_key: String,
    salt_key: String,
    secrets: EncryptedStore,
    derived: Mutex<Option<EncryptionKey>>,
}

impl HybridKey {
    /// `secrets` must be dedicated to this key, never the store it protects.
    pub fn new(name: &str, secrets: EncryptedStore) -> Self {
        Self {
            pass_key: format!("{TAG}-{name}-pass"),
            salt_key: format!("{TAG}-{name}-salt"),
            secrets,
            derived: Mutex::new(None),
        }
    }

    /// Opens the private `<name>-hybrid` store (AES-GCM, SHA-512, platform key
    /// with the same alias) over `raw`.
    pub fn with_vault(
        name: &str,
        raw: impl RawStore + 'static,
        vault: impl SecretVault + 'static,
    ) -> Result<Self, KeyError> {
        let private_name = format!("{name}-hybrid");
        let platform_key = KeychainKey::new(private_name.clone(), vault)?;
        let secrets = EncryptedStore::open(
            private_name,
            raw,
            AesGcmCipher,
            Sha512Hash,
            platform_key,
        )
        .map_err(secrets_err)?;
        Ok(Self::new(name, secrets))
    }

    fn load_secrets(&self) -> Result<Option<(Secret, Secret)>, KeyError> {
        let present = self.secrets.contains(&self.pass_key).map_err(secrets_err)?
            && self.secrets.contains(&self.salt_key).map_err(secrets_err)?;
        if !present {
            return Ok(None);
        }
        Ok(Some((
            self.read_secret(&self.pass_key)?,
            self.read_secret(&self.salt_key)?,
        )))
    }

    fn read_secret(&self, key: &str) -> Result<Secret, KeyError> {
        let encoded = self
            .secrets
            .get_string(key, None)
            .map_err(secrets_err)?
            .ok_or_else(|| KeyError::Inconsistent(format!("`{key}` is present but unreadable")))?;
        STANDARD
            .decode(encoded)
            .map(Zeroizing::new)
            .map_err(|e| KeyError::Decode(e.to_string()))
    }

    fn generate_secrets(&self) -> Result<(), KeyError> {
        let password = Zeroizing::new(random_bytes(SECRET_LEN));
        let salt = Zeroizing::new(random_bytes(SECRET_LEN));
        self.secrets
            .put_string(&self.pass_key, Some(&STANDARD.encode(password.as_slice())))
            .map_err(secrets_err)?;
        self.secrets
            .put_string(&self.salt_key, Some(&STANDARD.encode(salt.as_slice())))
            .map_err(secrets_err)
    }
}

impl KeyProvider for HybridKey {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        let mut guard = self
            .derived
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let (password, salt) = match self.load_secrets()? {
            Some(secrets) => secrets,
            None => {
                debug!(store = %self.secrets.name(), "generating hybrid key secrets");
                self.generate_secrets()?;
                self.load_secrets()?.ok_or_else(|| {
                    KeyError::Inconsistent("generated secrets missing after write".to_string())
                })?
            }
        };

        let key = PasswordKey::from_bytes(&password, &salt, Prf::HmacSha1).derive()?;
        *guard = Some(key.clone());
        Ok(key)
    }

    fn tag(&self) -> &str {
        TAG
    }
}

impl fmt::Debug for HybridKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridKey")
            .field("secrets", &self.secrets.name())
            .finish_non_exhaustive()
    }
}

fn secrets_err(err: EncryptedStoreError) -> KeyError {
    KeyError::Secrets(err.to_string())
}
