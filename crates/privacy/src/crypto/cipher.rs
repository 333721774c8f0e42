//! AES-256-GCM-SIV sealing of individual string fields and the text token
//! formats they are stored in.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so an accidental nonce collision degrades to "equal plaintexts are
//! visible" instead of a key-recovery break. Every call still draws a fresh
//! random nonce, so sealing the same value twice yields different tokens.

use std::str::FromStr;

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Prefix that appears at the start of every current-format token.
pub const VERSION_PREFIX: &str = "v1";

/// Shortest legacy token: base64 of a nonce, one sealed byte and a tag.
pub const LEGACY_MIN_LEN: usize = (NONCE_LEN + 1 + TAG_LEN).div_ceil(3) * 4;

/// A parsed, sealed field value.
///
/// The current string representation is
/// `v1.<base64url(nonce)>.<base64url(ciphertext+tag)>`. Older rows hold the
/// legacy form: padded standard base64 of `nonce ‖ ciphertext ‖ tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl EncryptedField {
    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parse a legacy token (`base64(nonce ‖ ciphertext ‖ tag)`, no prefix).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the value is not valid padded
    /// base64 or is too short to hold a nonce, a sealed byte and a tag.
    pub fn from_legacy(s: &str) -> Result<Self, CipherError> {
        if s.len() < LEGACY_MIN_LEN || s.len() % 4 != 0 {
            return Err(CipherError::InvalidFormat);
        }
        let raw = STANDARD.decode(s).map_err(|_| CipherError::InvalidFormat)?;
        if raw.len() <= NONCE_LEN + TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Parse either token format, trying the current one first.
    pub fn parse_any(s: &str) -> Result<Self, CipherError> {
        s.parse().or_else(|_| Self::from_legacy(s))
    }
}

impl FromStr for EncryptedField {
    type Err = CipherError;

    /// Parse a `v1.<nonce>.<ciphertext>` token.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| CipherError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;
        if ciphertext.len() <= TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }

        Ok(Self { nonce, ciphertext })
    }
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The stored value does not match any known token format.
    #[error("invalid encrypted field format")]
    InvalidFormat,

    /// A key secret was supplied but is blank.
    #[error("encryption key secret must not be blank")]
    EmptySecret,

    /// No encryption key is configured and passthrough was not requested.
    #[error("no field encryption key configured")]
    MissingKey,
}

/// Seal plaintext bytes under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be unreachable
/// with a valid key and nonce).
pub fn encrypt_field(plaintext: &[u8], key: &[u8]) -> Result<EncryptedField, CipherError> {
    let cipher = build_cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(EncryptedField {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open an [`EncryptedField`] back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key or tampered data).
pub fn decrypt_field(field: &EncryptedField, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&field.nonce);
    cipher
        .decrypt(nonce, field.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> Vec<u8> {
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn legacy_repr(field: &EncryptedField) -> String {
        let mut raw = field.nonce.to_vec();
        raw.extend_from_slice(&field.ciphertext);
        STANDARD.encode(raw)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = random_key();
        let plaintext = "Rua das Flores, 12".as_bytes();
        let encrypted = encrypt_field(plaintext, &key).unwrap();
        let decrypted = decrypt_field(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn fresh_nonce_per_call() {
        let key = random_key();
        let a = encrypt_field(b"same value", &key).unwrap();
        let b = encrypt_field(b"same value", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.to_string_repr(), b.to_string_repr());
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let encrypted = encrypt_field(b"secret", &random_key()).unwrap();
        assert!(decrypt_field(&encrypted, &random_key()).is_err());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_key = vec![0u8; 16];
        assert!(matches!(
            encrypt_field(b"x", &short_key),
            Err(CipherError::InvalidKeyLength)
        ));
    }

    #[test]
    fn string_repr_round_trip() {
        let key = random_key();
        let field = encrypt_field(b"hello", &key).unwrap();
        let s = field.to_string_repr();
        assert!(s.starts_with("v1."));
        let parsed: EncryptedField = s.parse().unwrap();
        assert_eq!(parsed, field);
    }

    #[test]
    fn legacy_repr_parses_and_opens() {
        let key = random_key();
        let field = encrypt_field(b"0800 123 456", &key).unwrap();
        let legacy = legacy_repr(&field);
        assert!(legacy.len() >= LEGACY_MIN_LEN);
        let parsed = EncryptedField::parse_any(&legacy).unwrap();
        assert_eq!(decrypt_field(&parsed, &key).unwrap(), b"0800 123 456");
    }

    #[test]
    fn legacy_rejects_short_or_unpadded_values() {
        assert!(EncryptedField::from_legacy("aGVsbG8=").is_err());
        assert!(EncryptedField::from_legacy("Maria Aparecida dos Santos Oliveira Silva").is_err());
    }

    #[test]
    fn parse_rejects_bad_prefix() {
        assert!("v2.abc.def".parse::<EncryptedField>().is_err());
    }

    #[test]
    fn parse_rejects_too_few_parts() {
        assert!("v1.abc".parse::<EncryptedField>().is_err());
    }

    #[test]
    fn parse_rejects_bad_base64() {
        assert!("v1.!!!.abc".parse::<EncryptedField>().is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = random_key();
        let mut field = encrypt_field(b"tamper me", &key).unwrap();
        field.ciphertext[0] ^= 0xFF;
        assert!(decrypt_field(&field, &key).is_err());
    }
}
