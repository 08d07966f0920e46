//! Encrypted storage for Vaultpref.
//! Keys are obfuscated with a one-way hash, values are sealed with AES (GCM or CBC)
//! under key material from a password, the OS keyring, or a hybrid of both.

pub mod cipher;
pub mod encrypted_store;
pub mod file_store;
pub mod hash;
pub mod hybrid_key;
pub mod key_provider;

pub use cipher::{AesCbcCipher, AesGcmCipher, Cipher, CryptoError, NoEncryption};
pub use encrypted_store::{EncryptedStore, EncryptedStoreError, INTEGRITY_TAG_KEY};
pub use file_store::FileStore;
pub use hash::{KeyHash, Sha1Hash, Sha256Hash, Sha512Hash};
pub use hybrid_key::HybridKey;
pub use key_provider::{
    EncryptionKey, FixedKey, InMemoryVault, KeyError, KeyProvider, KeychainKey, KeyringVault,
    NoKey, PasswordKey, Prf, SecretVault,
};
