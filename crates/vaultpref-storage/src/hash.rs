use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// One-way, deterministic transform from a logical key to the key actually stored.
pub trait KeyHash: Send + Sync {
    fn hash(&self, text: &str) -> String;

    fn tag(&self) -> &str;
}

impl<H: KeyHash + ?Sized> KeyHash for Box<H> {
    fn hash(&self, text: &str) -> String {
        (**self).hash(text)
    }

    fn tag(&self) -> &str {
        (**self).tag()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha512Hash;

impl KeyHash for Sha512Hash {
    fn hash(&self, text: &str) -> String {
        digest_base64::<Sha512>(text)
    }

    fn tag(&self) -> &str {
        "SHA-512"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hash;

impl KeyHash for Sha256Hash {
    fn hash(&self, text: &str) -> String {
        digest_base64::<Sha256>(text)
    }

    fn tag(&self) -> &str {
        "SHA-256"
    }
}

/// Faster, weaker digest. Fine for key obfuscation, not for anything adversarial.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hash;

impl KeyHash for Sha1Hash {
    fn hash(&self, text: &str) -> String {
        digest_base64::<Sha1>(text)
    }

    fn tag(&self) -> &str {
        "SHA-1"
    }
}

fn digest_base64<D: Digest>(text: &str) -> String {
    STANDARD.encode(D::digest(text.as_bytes()))
}
