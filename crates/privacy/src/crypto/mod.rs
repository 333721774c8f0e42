//! AES-256-GCM-SIV field encryption primitives.
//!
//! This module is free of persistence and HTTP dependencies. It provides the
//! single-value encrypt/decrypt operations used by the profile codec.
//!
//! # Token format
//!
//! ```text
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! The `v1` prefix leaves room for algorithm migration. Rows written before
//! the prefix existed hold `base64(nonce ‖ ciphertext ‖ tag)`; those are still
//! readable but never written.
//!
//! # Key invariants
//!
//! - One primary key seals every new value; retired keys only open.
//! - Key material is never logged, traced, or printed by `Debug`.

pub mod cipher;
pub mod field;
pub mod keys;

pub use cipher::{CipherError, KEY_LEN};
pub use field::FieldCipher;
pub use keys::{FieldKey, KeyRing};
