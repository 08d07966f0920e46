use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

const DERIVED_KEY_LEN: usize = 32;
const FIXED_KEY_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 1000;
const KEYCHAIN_TAG: &str = "PlatformKeyStore";

/// Symmetric key material plus the tag of the provider that produced it.
///
/// The raw bytes stay inside this crate; callers only ever hand the key back
/// to a [`crate::Cipher`].
#[derive(Clone)]
pub struct EncryptionKey {
    algorithm: &'static str,
    material: Arc<Zeroizing<Vec<u8>>>,
}

impl EncryptionKey {
    fn new(algorithm: &'static str, material: Vec<u8>) -> Self {
        Self {
            algorithm,
            material: Arc::new(Zeroizing::new(material)),
        }
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.material.len()
    }

    pub(crate) fn material(&self) -> &[u8] {
        &self.material
    }
}

impl fmt::Debug for EncryptionKey {
    // never print key bytes
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.material.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
    #[error("key too short: need at least {min} bytes, got {actual}")]
    InvalidLength { min: usize, actual: usize },
    #[error("persisted key state is inconsistent: {0}")]
    Inconsistent(String),
    #[error("secret store error: {0}")]
    Secrets(String),
}

/// Produces the symmetric key an encrypted store seals its values with.
pub trait KeyProvider: Send + Sync {
    /// Returns the key, deriving (and possibly persisting) it on first use.
    fn derive(&self) -> Result<EncryptionKey, KeyError>;

    fn tag(&self) -> &str;
}

impl<K: KeyProvider + ?Sized> KeyProvider for Box<K> {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        (**self).derive()
    }

    fn tag(&self) -> &str {
        (**self).tag()
    }
}

/// Uses the first 16 bytes of a caller-supplied string as an AES-128 key. No salt.
#[derive(Debug, Clone)]
pub struct FixedKey {
    key: EncryptionKey,
}

impl FixedKey {
    const TAG: &'static str = "FixedKey";

    pub fn new(key: &str) -> Result<Self, KeyError> {
        let bytes = key.as_bytes();
        if bytes.len() < FIXED_KEY_LEN {
            return Err(KeyError::InvalidLength {
                min: FIXED_KEY_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            key: EncryptionKey::new(Self::TAG, bytes[..FIXED_KEY_LEN].to_vec()),
        })
    }
}

impl KeyProvider for FixedKey {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        Ok(self.key.clone())
    }

    fn tag(&self) -> &str {
        Self::TAG
    }
}

/// Empty key for use with [`NoEncryption`](crate::cipher::NoEncryption).
/// AES ciphers reject it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKey;

impl KeyProvider for NoKey {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        Ok(EncryptionKey::new("NoKey", Vec::new()))
    }

    fn tag(&self) -> &str {
        "NoKey"
    }
}

/// Pseudo-random function used by [`PasswordKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prf {
    HmacSha1,
    HmacSha256,
}

impl Prf {
    pub fn tag(self) -> &'static str {
        match self {
            Prf::HmacSha1 => "PBKDF2WithHmacSHA1",
            Prf::HmacSha256 => "PBKDF2WithHmacSHA256",
        }
    }
}

/// PBKDF2 over (password, salt) with a fixed iteration count, 256-bit output.
/// Derivation happens once, at construction; the result is deterministic.
#[derive(Debug, Clone)]
pub struct PasswordKey {
    prf: Prf,
    key: EncryptionKey,
}

impl PasswordKey {
    pub fn new(password: &str, salt: &str, prf: Prf) -> Self {
        Self::from_bytes(password.as_bytes(), salt.as_bytes(), prf)
    }

    pub fn from_bytes(password: &[u8], salt: &[u8], prf: Prf) -> Self {
        let mut out = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
        match prf {
            Prf::HmacSha1 => pbkdf2_hmac::<Sha1>(password, salt, PBKDF2_ITERATIONS, &mut out),
            Prf::HmacSha256 => pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut out),
        }
        Self {
            prf,
            key: EncryptionKey::new(prf.tag(), out.to_vec()),
        }
    }
}

impl KeyProvider for PasswordKey {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        Ok(self.key.clone())
    }

    fn tag(&self) -> &str {
        self.prf.tag()
    }
}

/// Platform secret facility holding named key material (OS keychain in production).
pub trait SecretVault: Send + Sync {
    /// Fails when the platform facility cannot serve `alias` at all.
    fn ensure_available(&self, alias: &str) -> Result<(), KeyError>;

    fn load(&self, alias: &str) -> Result<Option<String>, KeyError>;

    fn store(&self, alias: &str, secret: &str) -> Result<(), KeyError>;
}

impl<V: SecretVault + ?Sized> SecretVault for Arc<V> {
    fn ensure_available(&self, alias: &str) -> Result<(), KeyError> {
        (**self).ensure_available(alias)
    }

    fn load(&self, alias: &str) -> Result<Option<String>, KeyError> {
        (**self).load(alias)
    }

    fn store(&self, alias: &str, secret: &str) -> Result<(), KeyError> {
        (**self).store(alias, secret)
    }
}

/// OS keyring-backed vault. Uses the `keyring` crate; one entry per alias.
#[derive(Debug, Clone)]
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, alias).map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

impl SecretVault for KeyringVault {
    fn ensure_available(&self, alias: &str) -> Result<(), KeyError> {
        self.entry(alias).map(|_| ())
    }

    fn load(&self, alias: &str) -> Result<Option<String>, KeyError> {
        match self.entry(alias)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    fn store(&self, alias: &str, secret: &str) -> Result<(), KeyError> {
        self.entry(alias)?
            .set_password(secret)
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

/// In-memory vault for tests and ephemeral sessions. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVault {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl SecretVault for InMemoryVault {
    fn ensure_available(&self, _alias: &str) -> Result<(), KeyError> {
        Ok(())
    }

    fn load(&self, alias: &str) -> Result<Option<String>, KeyError> {
        let guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        Ok(guard.get(alias).cloned())
    }

    fn store(&self, alias: &str, secret: &str) -> Result<(), KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        guard.insert(alias.to_string(), secret.to_string());
        Ok(())
    }
}

/// 256-bit key generated once under the platform secret facility and looked
/// up by alias afterwards. The first successful lookup is memoized.
pub struct KeychainKey<V: SecretVault = KeyringVault> {
    alias: String,
    vault: V,
    cached: Mutex<Option<EncryptionKey>>,
}

impl<V: SecretVault> KeychainKey<V> {
    /// Fails right away when the vault cannot serve `alias` on this platform.
    pub fn new(alias: impl Into<String>, vault: V) -> Result<Self, KeyError> {
        let alias = alias.into();
        vault.ensure_available(&alias)?;
        Ok(Self {
            alias,
            vault,
            cached: Mutex::new(None),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl<V: SecretVault> KeyProvider for KeychainKey<V> {
    fn derive(&self) -> Result<EncryptionKey, KeyError> {
        let mut guard = self
            .cached
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let key = match self.vault.load(&self.alias)? {
            Some(secret) => decode_key(&secret)?,
            None => {
                debug!(alias = %self.alias, "generating platform key");
                let key = generate_key();
                self.vault.store(&self.alias, &encode_key(&key))?;
                key
            }
        };
        *guard = Some(key.clone());
        Ok(key)
    }

    fn tag(&self) -> &str {
        KEYCHAIN_TAG
    }
}

impl<V: SecretVault> fmt::Debug for KeychainKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeychainKey")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn generate_key() -> EncryptionKey {
    EncryptionKey::new(KEYCHAIN_TAG, random_bytes(DERIVED_KEY_LEN))
}

fn encode_key(key: &EncryptionKey) -> String {
    general_purpose::STANDARD.encode(key.material())
}

fn decode_key(secret: &str) -> Result<EncryptionKey, KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if bytes.len() != DERIVED_KEY_LEN {
        return Err(KeyError::Decode(format!(
            "expected {DERIVED_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    Ok(EncryptionKey::new(KEYCHAIN_TAG, bytes))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fixed_key_truncates_to_sixteen_bytes() {
        let key = FixedKey::new("6wT7N2C#k#Tv+53DcLX@8d@-9t7-wScWZc")
            .expect("long enough")
            .derive()
            .expect("derive");
        assert_eq!(key.len(), 16);
        assert_eq!(key.material(), b"6wT7N2C#k#Tv+53D");
    }

    #[test]
    fn fixed_key_rejects_short_input() {
        let err = FixedKey::new("short").expect_err("should reject");
        assert!(matches!(err, KeyError::InvalidLength { min: 16, actual: 5 }));
    }

    #[test]
    fn password_key_is_deterministic() {
        let first = PasswordKey::new("pass", "salt", Prf::HmacSha1).derive().expect("derive");
        let second = PasswordKey::new("pass", "salt", Prf::HmacSha1).derive().expect("derive");
        let salted = PasswordKey::new("pass", "other", Prf::HmacSha1).derive().expect("derive");
        let sha256 = PasswordKey::new("pass", "salt", Prf::HmacSha256).derive().expect("derive");

        assert_eq!(first.material(), second.material());
        assert_ne!(first.material(), salted.material());
        assert_ne!(first.material(), sha256.material());
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn password_key_tags_follow_prf() {
        assert_eq!(PasswordKey::new("p", "s", Prf::HmacSha1).tag(), "PBKDF2WithHmacSHA1");
        assert_eq!(PasswordKey::new("p", "s", Prf::HmacSha256).tag(), "PBKDF2WithHmacSHA256");
    }

    struct UnsupportedVault;

    impl SecretVault for UnsupportedVault {
        fn ensure_available(&self, _alias: &str) -> Result<(), KeyError> {
            Err(KeyError::Keyring("no platform secret service".into()))
        }

        fn load(&self, _alias: &str) -> Result<Option<String>, KeyError> {
            unreachable!("construction must fail first")
        }

        fn store(&self, _alias: &str, _secret: &str) -> Result<(), KeyError> {
            unreachable!("construction must fail first")
        }
    }

    #[test]
    fn keychain_key_fails_at_construction_when_unsupported() {
        let err = KeychainKey::new("alias", UnsupportedVault).expect_err("should fail");
        assert!(matches!(err, KeyError::Keyring(_)));
    }

    #[test]
    fn keychain_key_generates_once_and_persists() {
        let vault = InMemoryVault::default();
        let first = KeychainKey::new("alias", vault.clone())
            .expect("available")
            .derive()
            .expect("derive");
        assert!(vault.load("alias").expect("load").is_some());

        // A second instance over the same vault sees the persisted key.
        let second = KeychainKey::new("alias", vault)
            .expect("available")
            .derive()
            .expect("derive");
        assert_eq!(first.material(), second.material());
    }

    #[test]
    fn keychain_key_first_use_is_memoized_across_threads() {
        let key = Arc::new(KeychainKey::new("shared", InMemoryVault::default()).expect("available"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let key = Arc::clone(&key);
                thread::spawn(move || key.derive().expect("derive").material().to_vec())
            })
            .collect();

        let results: Vec<Vec<u8>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn debug_does_not_leak_material() {
        let key = FixedKey::new("0123456789abcdefXYZ").expect("key").derive().expect("derive");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("0123456789"));
        assert!(rendered.contains("FixedKey"));
    }
}
