//! [`FieldCipher`]: the nullable single-value API used by the profile codec.
//!
//! Blank input never produces a token, and a token that cannot be opened
//! resolves to `None` instead of an error. Callers on the read path therefore
//! never see garbled plaintext, and one bad field never poisons a record.

use tracing::{debug, warn};

use super::cipher::{decrypt_field, encrypt_field, CipherError, EncryptedField};
use super::keys::KeyRing;

#[derive(Debug)]
enum CipherMode {
    Sealed(KeyRing),
    /// Development-only: values are stored as given.
    Passthrough,
}

/// Stateless, reentrant field cipher bound to a read-only key ring.
#[derive(Debug)]
pub struct FieldCipher {
    mode: CipherMode,
}

impl FieldCipher {
    /// A cipher that seals with the ring's primary key.
    pub fn new(keys: KeyRing) -> Self {
        Self {
            mode: CipherMode::Sealed(keys),
        }
    }

    /// A cipher that stores values in the clear. Only for development setups
    /// where no key exists; it refuses to pretend it can read sealed values.
    pub fn passthrough() -> Self {
        warn!("field encryption disabled: profile fields will be stored as plaintext");
        Self {
            mode: CipherMode::Passthrough,
        }
    }

    /// Build a cipher from configured secrets.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MissingKey`] when no primary secret is set and
    /// passthrough was not explicitly allowed, or [`CipherError::EmptySecret`]
    /// for a blank secret.
    pub fn from_secrets<S: AsRef<str>>(
        primary: Option<&str>,
        retired: &[S],
        allow_passthrough: bool,
    ) -> Result<Self, CipherError> {
        match primary.filter(|s| !s.trim().is_empty()) {
            Some(secret) => Ok(Self::new(KeyRing::from_secrets(secret, retired)?)),
            None if allow_passthrough => Ok(Self::passthrough()),
            None => Err(CipherError::MissingKey),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.mode, CipherMode::Sealed(_))
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            CipherMode::Sealed(_) => "sealed",
            CipherMode::Passthrough => "passthrough",
        }
    }

    /// Number of keys able to decrypt; zero in passthrough mode.
    pub fn key_count(&self) -> usize {
        match &self.mode {
            CipherMode::Sealed(ring) => ring.key_count(),
            CipherMode::Passthrough => 0,
        }
    }

    /// Seal a single value.
    ///
    /// Returns `Ok(None)` for `None`, empty, or whitespace-only input. Every
    /// call uses a fresh nonce, so equal inputs give different tokens.
    ///
    /// # Errors
    ///
    /// Propagates [`CipherError`] from the AEAD layer. The write path must
    /// abort on error rather than store the plaintext.
    pub fn encrypt_field(&self, plaintext: Option<&str>) -> Result<Option<String>, CipherError> {
        let Some(value) = plaintext.filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };
        match &self.mode {
            CipherMode::Sealed(ring) => {
                let sealed = encrypt_field(value.as_bytes(), ring.primary().as_bytes())?;
                Ok(Some(sealed.to_string_repr()))
            }
            CipherMode::Passthrough => {
                warn!("profile field stored without encryption");
                Ok(Some(value.to_owned()))
            }
        }
    }

    /// Open a single value.
    ///
    /// Returns `None` for `None`/empty input and for any value that cannot be
    /// opened (wrong key, corruption, not a token). Failures are logged.
    pub fn decrypt_field(&self, ciphertext: Option<&str>) -> Option<String> {
        let value = ciphertext.filter(|v| !v.is_empty())?;
        match self.open(value) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!(error = %e, "field decryption failed");
                None
            }
        }
    }

    /// Open a token, reporting why it failed.
    ///
    /// In passthrough mode non-token values are returned unchanged and tokens
    /// are refused.
    pub fn open(&self, value: &str) -> Result<String, CipherError> {
        match &self.mode {
            CipherMode::Sealed(ring) => {
                let field = EncryptedField::parse_any(value)?;
                let plaintext = ring
                    .decryption_keys()
                    .find_map(|key| decrypt_field(&field, key.as_bytes()).ok())
                    .ok_or(CipherError::AeadFailure)?;
                String::from_utf8(plaintext).map_err(|_| CipherError::InvalidFormat)
            }
            CipherMode::Passthrough if Self::looks_encrypted(Some(value)) => {
                Err(CipherError::MissingKey)
            }
            CipherMode::Passthrough => Ok(value.to_owned()),
        }
    }

    /// Re-seal a stored value under the primary key.
    ///
    /// Tokens are opened with any ring key first; values that do not look
    /// encrypted are treated as legacy plaintext and sealed directly.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MissingKey`] in passthrough mode, or the open /
    /// seal error when the token cannot be read.
    pub fn reencrypt_field(&self, value: Option<&str>) -> Result<Option<String>, CipherError> {
        if !self.is_sealed() {
            return Err(CipherError::MissingKey);
        }
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };
        if Self::looks_encrypted(Some(value)) {
            let plaintext = self.open(value)?;
            self.encrypt_field(Some(&plaintext))
        } else {
            debug!("sealing legacy plaintext field during re-encryption");
            self.encrypt_field(Some(value))
        }
    }

    /// Heuristic: does `value` look like a stored token?
    ///
    /// Accepts the current `v1.` form and the legacy bare-base64 form. This is
    /// a best-effort shape check, not proof: a plaintext value that happens to
    /// be long, padded base64 is classified as a token.
    pub fn looks_encrypted(value: Option<&str>) -> bool {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            return false;
        };
        if value.starts_with("v1.") {
            return value.parse::<EncryptedField>().is_ok();
        }
        value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
            && EncryptedField::from_legacy(value).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::FieldKey;

    fn cipher(secret: &str) -> FieldCipher {
        FieldCipher::new(KeyRing::new(FieldKey::derive(secret).unwrap()))
    }

    #[test]
    fn round_trip() {
        let c = cipher("k1");
        for s in ["Ana Lima", "+55 11 91234-5678", "ü ñ 漢字", "x"] {
            let token = c.encrypt_field(Some(s)).unwrap();
            assert_eq!(c.decrypt_field(token.as_deref()).as_deref(), Some(s));
        }
    }

    #[test]
    fn encryption_is_not_deterministic() {
        let c = cipher("k1");
        let a = c.encrypt_field(Some("same")).unwrap();
        let b = c.encrypt_field(Some("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn null_and_blank_handling() {
        let c = cipher("k1");
        assert_eq!(c.encrypt_field(None).unwrap(), None);
        assert_eq!(c.encrypt_field(Some("")).unwrap(), None);
        assert_eq!(c.encrypt_field(Some("   ")).unwrap(), None);
        assert_eq!(c.decrypt_field(None), None);
        assert_eq!(c.decrypt_field(Some("")), None);
    }

    #[test]
    fn wrong_key_yields_none() {
        let token = cipher("k1").encrypt_field(Some("secret")).unwrap();
        assert_eq!(cipher("k2").decrypt_field(token.as_deref()), None);
    }

    #[test]
    fn garbage_yields_none() {
        let c = cipher("k1");
        assert_eq!(c.decrypt_field(Some("not a token at all")), None);
        assert_eq!(c.decrypt_field(Some("v1.AAAA.BBBB")), None);
    }

    #[test]
    fn retired_key_still_opens() {
        let old = cipher("old");
        let token = old.encrypt_field(Some("Rua A, 10")).unwrap();
        let rotated = FieldCipher::new(
            KeyRing::new(FieldKey::derive("new").unwrap())
                .with_retired(FieldKey::derive("old").unwrap()),
        );
        assert_eq!(rotated.decrypt_field(token.as_deref()).as_deref(), Some("Rua A, 10"));

        let resealed = rotated.reencrypt_field(token.as_deref()).unwrap();
        assert_eq!(cipher("new").decrypt_field(resealed.as_deref()).as_deref(), Some("Rua A, 10"));
    }

    #[test]
    fn reencrypt_seals_legacy_plaintext() {
        let c = cipher("k1");
        let sealed = c.reencrypt_field(Some("Porto Alegre")).unwrap().unwrap();
        assert!(FieldCipher::looks_encrypted(Some(&sealed)));
        assert_eq!(c.decrypt_field(Some(&sealed)).as_deref(), Some("Porto Alegre"));
    }

    #[test]
    fn looks_encrypted_classification() {
        let c = cipher("k1");
        let token = c.encrypt_field(Some("01310-100")).unwrap().unwrap();
        assert!(FieldCipher::looks_encrypted(Some(&token)));
        assert!(!FieldCipher::looks_encrypted(None));
        assert!(!FieldCipher::looks_encrypted(Some("")));
        assert!(!FieldCipher::looks_encrypted(Some("Ana Lima")));
        assert!(!FieldCipher::looks_encrypted(Some("01310-100")));
        assert!(!FieldCipher::looks_encrypted(Some("v1.not.valid")));
        // Legacy bare base64 of nonce + ciphertext + tag.
        assert!(FieldCipher::looks_encrypted(Some(
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        )));
    }

    #[test]
    fn missing_key_is_an_error_unless_passthrough() {
        let none: &[&str] = &[];
        assert!(matches!(
            FieldCipher::from_secrets(None, none, false),
            Err(CipherError::MissingKey)
        ));
        assert!(matches!(
            FieldCipher::from_secrets(Some("  "), none, false),
            Err(CipherError::MissingKey)
        ));
        let dev = FieldCipher::from_secrets(None, none, true).unwrap();
        assert!(!dev.is_sealed());
        assert_eq!(dev.key_count(), 0);
    }

    #[test]
    fn passthrough_never_exposes_tokens() {
        let dev = FieldCipher::passthrough();
        assert_eq!(dev.encrypt_field(Some("Ana")).unwrap().as_deref(), Some("Ana"));
        assert_eq!(dev.decrypt_field(Some("Ana")).as_deref(), Some("Ana"));
        let token = cipher("k1").encrypt_field(Some("Ana")).unwrap();
        assert_eq!(dev.decrypt_field(token.as_deref()), None);
        assert!(dev.reencrypt_field(Some("Ana")).is_err());
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn passthrough_write_is_logged() {
        let dev = FieldCipher::passthrough();
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();

        let stored = tracing::subscriber::with_default(subscriber, || {
            assert_eq!(dev.encrypt_field(Some("  ")).unwrap(), None);
            dev.encrypt_field(Some("Ana")).unwrap()
        });
        assert_eq!(stored.as_deref(), Some("Ana"));

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out.matches("stored without encryption").count(), 1);
        assert!(out.contains("WARN"));
    }
}
