//! Profile Field Codec: applies the [`FieldCipher`] to exactly the sensitive
//! attributes of a profile on the way into storage and on the way out.
//!
//! # Module invariants
//!
//! - Non-sensitive attributes are copied byte-for-byte.
//! - On the write path an encryption error aborts the whole record.
//! - On the read path a field that cannot be opened becomes `None`; the other
//!   fields are still returned.
//! - Values that already look sealed are not sealed again. Callers still
//!   decrypt before editing; the check is only a second line of defence.

pub mod fields;

pub use fields::{is_sensitive, SENSITIVE_FIELDS};

use std::sync::Arc;

use common::Profile;
use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::{cipher::VERSION_PREFIX, CipherError, FieldCipher};
use crate::store::Row;
use fields::sensitive_fields_mut;

/// Encrypts and decrypts the sensitive attributes of profile records.
#[derive(Clone, Debug)]
pub struct ProfileCodec {
    cipher: Arc<FieldCipher>,
}

impl ProfileCodec {
    pub fn new(cipher: Arc<FieldCipher>) -> Self {
        Self { cipher }
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Return a copy of `profile` with every present, non-blank sensitive
    /// attribute sealed. Absent or blank attributes are passed through.
    ///
    /// # Errors
    ///
    /// Returns the first [`CipherError`]; nothing should be written then.
    pub fn encrypt_profile_fields(&self, profile: &Profile) -> Result<Profile, CipherError> {
        let mut out = profile.clone();
        for (name, slot) in sensitive_fields_mut(&mut out) {
            *slot = self.seal(name, slot.take())?;
        }
        Ok(out)
    }

    /// Return a copy of `profile` with every sensitive attribute opened.
    pub fn decrypt_profile_fields(&self, profile: &Profile) -> Profile {
        let mut out = profile.clone();
        for (name, slot) in sensitive_fields_mut(&mut out) {
            *slot = self.open(name, slot.take());
        }
        out
    }

    /// Seal the sensitive keys present in a row or partial update patch.
    /// Keys absent from `row` stay absent; JSON `null` stays `null`.
    ///
    /// # Errors
    ///
    /// Returns the first [`CipherError`].
    pub fn encrypt_row(&self, row: &Row) -> Result<Row, CipherError> {
        let mut out = row.clone();
        for name in SENSITIVE_FIELDS {
            if let Some(Value::String(value)) = out.get_mut(name) {
                if let Some(sealed) = self.seal(name, Some(std::mem::take(value)))? {
                    *value = sealed;
                }
            }
        }
        Ok(out)
    }

    /// Open the sensitive keys present in a row. Unreadable values become `null`.
    pub fn decrypt_row(&self, row: &Row) -> Row {
        let mut out = row.clone();
        for name in SENSITIVE_FIELDS {
            if let Some(slot) = out.get_mut(name) {
                if let Value::String(value) = slot {
                    *slot = match self.open(name, Some(std::mem::take(value))) {
                        Some(plain) => Value::String(plain),
                        None => Value::Null,
                    };
                }
            }
        }
        out
    }

    /// Re-seal every sensitive attribute under the primary key.
    ///
    /// Legacy plaintext is sealed, retired-key tokens are upgraded. A field
    /// that cannot be opened is left exactly as stored and logged.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MissingKey`] when the cipher is in passthrough mode.
    pub fn rotate_profile_fields(&self, profile: &Profile) -> Result<Profile, CipherError> {
        if !self.cipher.is_sealed() {
            return Err(CipherError::MissingKey);
        }
        let mut out = profile.clone();
        for (name, slot) in sensitive_fields_mut(&mut out) {
            match self.cipher.reencrypt_field(slot.as_deref()) {
                Ok(Some(token)) => *slot = Some(token),
                Ok(None) => {}
                Err(e) => warn!(field = name, error = %e, "field left untouched during key rotation"),
            }
        }
        Ok(out)
    }

    fn seal(&self, name: &str, value: Option<String>) -> Result<Option<String>, CipherError> {
        match value {
            Some(v) if v.trim().is_empty() => Ok(Some(v)),
            Some(v) if FieldCipher::looks_encrypted(Some(&v)) => {
                debug!(field = name, "value already sealed; not sealing again");
                Ok(Some(v))
            }
            Some(v) => self.cipher.encrypt_field(Some(&v)),
            None => Ok(None),
        }
    }

    fn open(&self, name: &str, value: Option<String>) -> Option<String> {
        match value {
            Some(v) if v.is_empty() => Some(v),
            Some(v) if !FieldCipher::looks_encrypted(Some(&v)) && !has_token_prefix(&v) => {
                debug!(field = name, "legacy plaintext field returned as stored");
                Some(v)
            }
            Some(v) => match self.cipher.open(&v) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    warn!(field = name, error = %e, "profile field could not be decrypted");
                    None
                }
            },
            None => None,
        }
    }
}

/// A `v1.` value that fails to parse is a damaged token, not legacy plaintext.
fn has_token_prefix(value: &str) -> bool {
    value
        .strip_prefix(VERSION_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FieldKey, KeyRing};
    use serde_json::{json, Map};

    fn codec(secret: &str) -> ProfileCodec {
        let ring = KeyRing::new(FieldKey::derive(secret).unwrap());
        ProfileCodec::new(Arc::new(FieldCipher::new(ring)))
    }

    fn sample() -> Profile {
        Profile {
            id: Some(uuid::Uuid::from_u128(0x7f1c_1a3e_52c4_4c1b_9f3d_0b4c_2a9f_1e11)),
            role: Some("student".into()),
            email: Some("ana.lima@example.org".into()),
            full_name: Some("Ana Lima".into()),
            phone: Some("+55 51 99876-5432".into()),
            address_line_1: Some("Rua dos Andradas, 1001".into()),
            address_line_2: None,
            city: Some("Porto Alegre".into()),
            zip_code: Some("90020-007".into()),
            state: Some("RS".into()),
            country: Some("Brazil".into()),
            extra: Map::new(),
        }
    }

    #[test]
    fn encrypt_then_decrypt_restores_profile() {
        let c = codec("k");
        let profile = sample();
        let sealed = c.encrypt_profile_fields(&profile).unwrap();
        assert_ne!(sealed.full_name, profile.full_name);
        assert_ne!(sealed.zip_code, profile.zip_code);
        assert_eq!(c.decrypt_profile_fields(&sealed), profile);
    }

    #[test]
    fn identifiers_pass_through_untouched() {
        let c = codec("k");
        let profile = sample();
        let sealed = c.encrypt_profile_fields(&profile).unwrap();
        assert_eq!(sealed.id, profile.id);
        assert_eq!(sealed.role, profile.role);
        assert_eq!(sealed.email, profile.email);
        assert_eq!(sealed.state, profile.state);
        assert_eq!(sealed.country, profile.country);
        assert_eq!(sealed.address_line_2, None);
    }

    #[test]
    fn corrupted_field_does_not_poison_record() {
        let c = codec("k");
        let mut sealed = c.encrypt_profile_fields(&sample()).unwrap();
        // Swap the first character of the sealed part; still token-shaped.
        let phone = sealed.phone.take().unwrap();
        let at = phone.rfind('.').unwrap() + 1;
        let swapped = if phone[at..].starts_with('A') { "B" } else { "A" };
        sealed.phone = Some(format!("{}{}{}", &phone[..at], swapped, &phone[at + 1..]));

        let opened = c.decrypt_profile_fields(&sealed);
        assert_eq!(opened.full_name.as_deref(), Some("Ana Lima"));
        assert_eq!(opened.phone, None);
        assert_eq!(opened.city.as_deref(), Some("Porto Alegre"));
    }

    #[test]
    fn already_sealed_values_are_not_sealed_twice() {
        let c = codec("k");
        let once = c.encrypt_profile_fields(&sample()).unwrap();
        let twice = c.encrypt_profile_fields(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(c.decrypt_profile_fields(&twice), sample());
    }

    #[test]
    fn legacy_plaintext_is_tolerated_on_read() {
        let c = codec("k");
        let mut mixed = c.encrypt_profile_fields(&sample()).unwrap();
        mixed.city = Some("Pelotas".into());
        let opened = c.decrypt_profile_fields(&mixed);
        assert_eq!(opened.city.as_deref(), Some("Pelotas"));
        assert_eq!(opened.full_name.as_deref(), Some("Ana Lima"));
    }

    #[test]
    fn blank_values_are_not_sealed() {
        let c = codec("k");
        let mut profile = sample();
        profile.address_line_2 = Some(String::new());
        let sealed = c.encrypt_profile_fields(&profile).unwrap();
        assert_eq!(sealed.address_line_2.as_deref(), Some(""));
    }

    #[test]
    fn wrong_key_reads_as_unavailable() {
        let sealed = codec("k1").encrypt_profile_fields(&sample()).unwrap();
        let opened = codec("k2").decrypt_profile_fields(&sealed);
        assert_eq!(opened.full_name, None);
        assert_eq!(opened.email, sample().email);
    }

    #[test]
    fn patch_only_touches_present_keys() {
        let c = codec("k");
        let patch = json!({"phone": "+55 51 3333-4444", "state": "SC", "address_line_2": null})
            .as_object()
            .cloned()
            .unwrap();
        let sealed = c.encrypt_row(&patch).unwrap();
        assert_eq!(sealed.len(), 3);
        assert!(!sealed.contains_key("full_name"));
        assert_eq!(sealed["state"], "SC");
        assert_eq!(sealed["address_line_2"], Value::Null);
        assert_ne!(sealed["phone"], "+55 51 3333-4444");

        let opened = c.decrypt_row(&sealed);
        assert_eq!(opened, patch);
    }

    #[test]
    fn damaged_token_is_not_returned_as_plaintext() {
        let c = codec("k");
        let mut profile = sample();
        profile.zip_code = Some("v1.AAAA.%%%%".into());
        assert_eq!(c.decrypt_profile_fields(&profile).zip_code, None);
    }

    #[test]
    fn unreadable_row_value_becomes_null() {
        let sealed = codec("k1")
            .encrypt_row(json!({"full_name": "Ana"}).as_object().unwrap())
            .unwrap();
        let opened = codec("k2").decrypt_row(&sealed);
        assert_eq!(opened["full_name"], Value::Null);
    }

    #[test]
    fn rotation_moves_fields_to_new_primary() {
        let old = codec("old");
        let sealed = old.encrypt_profile_fields(&sample()).unwrap();

        let ring = KeyRing::new(FieldKey::derive("new").unwrap())
            .with_retired(FieldKey::derive("old").unwrap());
        let rotating = ProfileCodec::new(Arc::new(FieldCipher::new(ring)));
        let rotated = rotating.rotate_profile_fields(&sealed).unwrap();

        assert_eq!(codec("new").decrypt_profile_fields(&rotated), sample());
        assert_eq!(old.decrypt_profile_fields(&rotated).full_name, None);
    }

    #[test]
    fn rotation_requires_a_key() {
        let dev = ProfileCodec::new(Arc::new(FieldCipher::passthrough()));
        assert!(dev.rotate_profile_fields(&sample()).is_err());
    }
}
