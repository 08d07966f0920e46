use std::path::PathBuf;

use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;
use vaultpref_core::RawStore;
use vaultpref_prefs::{PreferenceContext, TaskPool};
use vaultpref_storage::{
    AesCbcCipher, AesGcmCipher, Cipher, EncryptedStore, FileStore, FixedKey, HybridKey, KeyHash,
    KeyProvider, KeychainKey, KeyringVault, NoEncryption, NoKey, PasswordKey, Prf, SecretVault,
    Sha1Hash, Sha256Hash, Sha512Hash,
};

use crate::config::{CipherKind, Config, CryptoConfig, HashKind, KeyKind, PrfKind};

/// Keyring service under which platform keys are stored.
pub const KEYRING_SERVICE: &str = "vaultpref";

/// Resolve the default data directory for Vaultpref.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("vaultpref"))
}

fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Open the configured store: `<data_dir>/<name>.json`, with hybrid secrets
/// in `<name>-hybrid.json` and platform keys in the OS keychain.
pub fn open_context(config: &Config) -> Result<PreferenceContext> {
    let root = data_root(config)?;
    debug!(?root, store = %config.name, "opening encrypted store");
    let raw = FileStore::open(root.join(format!("{}.json", config.name)))?;
    let hybrid_raw = FileStore::open(root.join(format!("{}-hybrid.json", config.name)))?;
    let store = open_store(config, raw, hybrid_raw, KeyringVault::new(KEYRING_SERVICE))?;
    context_for(config, store)
}

pub(crate) fn context_for(config: &Config, store: EncryptedStore) -> Result<PreferenceContext> {
    let pool = match config.pool_threads {
        Some(threads) => TaskPool::new(threads)?,
        None => TaskPool::with_default_size()?,
    };
    Ok(PreferenceContext::new(store, pool))
}

/// Map the `[crypto]` section to strategies and open the store over `raw`.
pub(crate) fn open_store(
    config: &Config,
    raw: impl RawStore + 'static,
    hybrid_raw: impl RawStore + 'static,
    vault: impl SecretVault + 'static,
) -> Result<EncryptedStore> {
    let crypto = &config.crypto;
    let key = key_provider(&config.name, crypto, hybrid_raw, vault)?;
    Ok(EncryptedStore::open(
        config.name.clone(),
        raw,
        cipher(crypto.cipher),
        hash(crypto.hash),
        key,
    )?)
}

fn cipher(kind: CipherKind) -> Box<dyn Cipher> {
    match kind {
        CipherKind::AesGcm => Box::new(AesGcmCipher),
        CipherKind::AesCbc => Box::new(AesCbcCipher),
        CipherKind::None => Box::new(NoEncryption),
    }
}

fn hash(kind: HashKind) -> Box<dyn KeyHash> {
    match kind {
        HashKind::Sha512 => Box::new(Sha512Hash),
        HashKind::Sha256 => Box::new(Sha256Hash),
        HashKind::Sha1 => Box::new(Sha1Hash),
    }
}

fn key_provider(
    name: &str,
    crypto: &CryptoConfig,
    hybrid_raw: impl RawStore + 'static,
    vault: impl SecretVault + 'static,
) -> Result<Box<dyn KeyProvider>> {
    let key: Box<dyn KeyProvider> = match crypto.key {
        KeyKind::Password => {
            let password = required_password(crypto)?;
            let salt = crypto
                .salt
                .as_deref()
                .ok_or_else(|| color_eyre::eyre::eyre!("crypto.salt is required for password keys"))?;
            let prf = match crypto.prf {
                PrfKind::HmacSha1 => Prf::HmacSha1,
                PrfKind::HmacSha256 => Prf::HmacSha256,
            };
            Box::new(PasswordKey::new(&password, salt, prf))
        }
        KeyKind::Fixed => Box::new(FixedKey::new(&required_password(crypto)?)?),
        KeyKind::Keychain => Box::new(KeychainKey::new(name, vault)?),
        KeyKind::Hybrid => Box::new(HybridKey::with_vault(name, hybrid_raw, vault)?),
        KeyKind::None => Box::new(NoKey),
    };
    Ok(key)
}

fn required_password(crypto: &CryptoConfig) -> Result<String> {
    crypto.password().ok_or_else(|| {
        color_eyre::eyre::eyre!(
            "a password is required: set crypto.password or {}",
            crate::config::PASSWORD_ENV
        )
    })
}

/// Helper for tests: a context over in-memory stores and an in-memory vault.
#[cfg(test)]
pub fn test_context(config: &Config) -> Result<PreferenceContext> {
    use vaultpref_core::MemoryStore;
    use vaultpref_storage::InMemoryVault;

    let store = open_store(
        config,
        MemoryStore::new(),
        MemoryStore::new(),
        InMemoryVault::default(),
    )?;
    context_for(config, store)
}
