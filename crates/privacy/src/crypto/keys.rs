//! [`FieldKey`] derivation and the [`KeyRing`] used for key rotation.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::cipher::{CipherError, KEY_LEN};

/// Domain-separation label mixed into every derived key.
const DERIVATION_LABEL: &[u8] = b"profile-field-cipher/v1";

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which key material lives in RAM.
#[derive(Clone)]
pub struct FieldKey(Box<[u8; KEY_LEN]>);

impl FieldKey {
    /// Derive a key from a configured secret string with HMAC-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EmptySecret`] if the secret is blank.
    pub fn derive(secret: &str) -> Result<Self, CipherError> {
        if secret.trim().is_empty() {
            return Err(CipherError::EmptySecret);
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| CipherError::InvalidKeyLength)?;
        mac.update(DERIVATION_LABEL);
        let digest = mac.finalize().into_bytes();

        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(&digest);
        Ok(Self(buf))
    }

    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] if the slice has the wrong length.
    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, CipherError> {
        if key_bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(key_bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for FieldKey {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("FieldKey([REDACTED])")
    }
}

/// The primary key used for every encryption plus any retired keys that are
/// still accepted for decryption.
///
/// Read-only after construction; share it behind an `Arc`.
#[derive(Clone, Debug)]
pub struct KeyRing {
    primary: FieldKey,
    retired: Vec<FieldKey>,
}

impl KeyRing {
    pub fn new(primary: FieldKey) -> Self {
        Self {
            primary,
            retired: Vec::new(),
        }
    }

    /// Build a ring from the configured primary secret and retired secrets.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EmptySecret`] if any secret is blank.
    pub fn from_secrets<S: AsRef<str>>(primary: &str, retired: &[S]) -> Result<Self, CipherError> {
        let mut ring = Self::new(FieldKey::derive(primary)?);
        for secret in retired {
            ring = ring.with_retired(FieldKey::derive(secret.as_ref())?);
        }
        Ok(ring)
    }

    /// Accept `key` for decryption only.
    pub fn with_retired(mut self, key: FieldKey) -> Self {
        self.retired.push(key);
        self
    }

    pub fn primary(&self) -> &FieldKey {
        &self.primary
    }

    /// Every key that may open a token, primary first.
    pub fn decryption_keys(&self) -> impl Iterator<Item = &FieldKey> {
        std::iter::once(&self.primary).chain(self.retired.iter())
    }

    /// Number of keys able to decrypt.
    pub fn key_count(&self) -> usize {
        1 + self.retired.len()
    }
}
