use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{
    aead::{Aead, KeyInit, Nonce},
    Aes128Gcm, Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::key_provider::EncryptionKey;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64: {reason}")]
    Decode { reason: String },
    #[error("ciphertext too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },
    #[error("unsupported key length {len} for {cipher}")]
    InvalidKey { cipher: &'static str, len: usize },
    #[error("encrypt failed: {reason}")]
    Encrypt { reason: String },
    #[error("decrypt failed: {reason}")]
    Decrypt { reason: String },
    #[error("decrypted payload is not utf-8")]
    Utf8,
}

/// Symmetric cipher turning plaintext into `base64(iv ++ ciphertext)` and back.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError>;

    fn decrypt(&self, key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError>;

    /// Algorithm tag recorded in the store's integrity tag.
    fn tag(&self) -> &str;

    /// Length of the initialization vector prepended to every ciphertext.
    fn iv_len(&self) -> usize;
}

impl<C: Cipher + ?Sized> Cipher for Box<C> {
    fn encrypt(&self, key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
        (**self).encrypt(key, plaintext)
    }

    fn decrypt(&self, key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
        (**self).decrypt(key, encoded)
    }

    fn tag(&self) -> &str {
        (**self).tag()
    }

    fn iv_len(&self) -> usize {
        (**self).iv_len()
    }
}

/// AES in GCM mode: authenticated, no padding, 12-byte nonce.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    const TAG: &'static str = "AES/GCM/NoPadding";
    const IV_LEN: usize = 12;
    const AUTH_TAG_LEN: usize = 16;
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
        let iv = random_iv(Self::IV_LEN);
        let material = key.material();
        let ciphertext = match material.len() {
            16 => seal::<Aes128Gcm>(material, &iv, plaintext.as_bytes())?,
            32 => seal::<Aes256Gcm>(material, &iv, plaintext.as_bytes())?,
            len => {
                return Err(CryptoError::InvalidKey {
                    cipher: Self::TAG,
                    len,
                })
            }
        };
        Ok(join(&iv, &ciphertext))
    }

    fn decrypt(&self, key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
        let data = split(encoded, Self::IV_LEN + Self::AUTH_TAG_LEN)?;
        let (iv, ciphertext) = data.split_at(Self::IV_LEN);
        let material = key.material();
        let plaintext = match material.len() {
            16 => open::<Aes128Gcm>(material, iv, ciphertext)?,
            32 => open::<Aes256Gcm>(material, iv, ciphertext)?,
            len => {
                return Err(CryptoError::InvalidKey {
                    cipher: Self::TAG,
                    len,
                })
            }
        };
        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }

    fn tag(&self) -> &str {
        Self::TAG
    }

    fn iv_len(&self) -> usize {
        Self::IV_LEN
    }
}

/// AES in CBC mode with PKCS#7 padding and a 16-byte IV. Not authenticated:
/// tampering shows up as a padding or utf-8 failure at best.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCbcCipher;

impl AesCbcCipher {
    const TAG: &'static str = "AES/CBC/PKCS7Padding";
    const IV_LEN: usize = 16;
}

impl Cipher for AesCbcCipher {
    fn encrypt(&self, key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
        let iv = random_iv(Self::IV_LEN);
        let material = key.material();
        let ciphertext = match material.len() {
            16 => cbc_encrypt::<Aes128CbcEnc>(material, &iv, plaintext.as_bytes())?,
            32 => cbc_encrypt::<Aes256CbcEnc>(material, &iv, plaintext.as_bytes())?,
            len => {
                return Err(CryptoError::InvalidKey {
                    cipher: Self::TAG,
                    len,
                })
            }
        };
        Ok(join(&iv, &ciphertext))
    }

    fn decrypt(&self, key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
        let data = split(encoded, Self::IV_LEN)?;
        let (iv, ciphertext) = data.split_at(Self::IV_LEN);
        let material = key.material();
        let plaintext = match material.len() {
            16 => cbc_decrypt::<Aes128CbcDec>(material, iv, ciphertext)?,
            32 => cbc_decrypt::<Aes256CbcDec>(material, iv, ciphertext)?,
            len => {
                return Err(CryptoError::InvalidKey {
                    cipher: Self::TAG,
                    len,
                })
            }
        };
        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }

    fn tag(&self) -> &str {
        Self::TAG
    }

    fn iv_len(&self) -> usize {
        Self::IV_LEN
    }
}

/// Pass-through: values are stored as given. Only useful for debugging a
/// store layout, or with data that is not secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl Cipher for NoEncryption {
    fn encrypt(&self, _key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, _key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
        Ok(encoded.to_string())
    }

    fn tag(&self) -> &str {
        "NoEncryption"
    }

    fn iv_len(&self) -> usize {
        0
    }
}

fn random_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn join(iv: &[u8], ciphertext: &[u8]) -> String {
    let mut out = Vec::with_capacity(iv.len() + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    STANDARD.encode(out)
}

fn split(encoded: &str, min: usize) -> Result<Vec<u8>, CryptoError> {
    let data = STANDARD.decode(encoded).map_err(|e| CryptoError::Decode {
        reason: e.to_string(),
    })?;
    if data.len() < min {
        return Err(CryptoError::TooShort {
            min,
            actual: data.len(),
        });
    }
    Ok(data)
}

fn seal<C: Aead + KeyInit>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|e| CryptoError::Encrypt {
        reason: format!("cipher init failed: {e}"),
    })?;
    cipher
        .encrypt(<Nonce<C>>::from_slice(iv), plaintext)
        .map_err(|e| CryptoError::Encrypt {
            reason: e.to_string(),
        })
}

fn open<C: Aead + KeyInit>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|e| CryptoError::Decrypt {
        reason: format!("cipher init failed: {e}"),
    })?;
    cipher
        .decrypt(<Nonce<C>>::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Decrypt {
            reason: "authentication failed".to_string(),
        })
}

fn cbc_encrypt<C: KeyIvInit + BlockEncryptMut>(
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slices(key, iv).map_err(|e| CryptoError::Encrypt {
        reason: format!("cipher init failed: {e}"),
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<C: KeyIvInit + BlockDecryptMut>(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slices(key, iv).map_err(|e| CryptoError::Decrypt {
        reason: format!("cipher init failed: {e}"),
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt {
            reason: "invalid padding".to_string(),
        })
}
