//! Configuration loading and validation for the privacy service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid, or if no field
//! encryption key is configured and plaintext passthrough was not explicitly
//! allowed.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::FieldCipher;
use crate::ledger::{HttpIpLookup, MAX_PAGE_SIZE};

/// Consent text stored with each consent when none is configured.
pub const DEFAULT_CONSENT_TEXT: &str = "I consent to the school processing my personal data \
(name, phone number and address) for course administration and communication. \
I can withdraw this consent at any time.";

/// Validated service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Secret the field encryption key is derived from. Required unless
    /// `allow_plaintext_passthrough` is set.
    #[serde(default)]
    pub field_encryption_key: Option<String>,

    /// Comma-separated secrets of retired keys, used only to decrypt.
    #[serde(default)]
    pub previous_encryption_keys: Option<String>,

    /// Development only: store profile fields unencrypted.
    #[serde(default)]
    pub allow_plaintext_passthrough: bool,

    /// Text stored verbatim with every consent.
    #[serde(default = "default_consent_text")]
    pub consent_text: String,

    /// Port the HTTP adapter listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint of an OTEL collector. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Host of a plain-HTTP IP echo service.
    #[serde(default)]
    pub ip_lookup_host: Option<String>,

    #[serde(default = "default_ip_lookup_port")]
    pub ip_lookup_port: u16,

    #[serde(default = "default_ip_lookup_path")]
    pub ip_lookup_path: String,

    /// Deadline (milliseconds) for the IP lookup.
    #[serde(default = "default_ip_lookup_timeout_ms")]
    pub ip_lookup_timeout_ms: u64,

    /// Page size of the admin consent listing when the request has none.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

fn default_consent_text() -> String {
    DEFAULT_CONSENT_TEXT.into()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_ip_lookup_port() -> u16 {
    80
}
fn default_ip_lookup_path() -> String {
    "/".into()
}
fn default_ip_lookup_timeout_ms() -> u64 {
    2000
}
fn default_page_size() -> usize {
    20
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |s: &Option<String>| s.as_ref().map(|_| "<redacted>");
        f.debug_struct("Config")
            .field("field_encryption_key", &redacted(&self.field_encryption_key))
            .field("previous_encryption_keys", &redacted(&self.previous_encryption_keys))
            .field("allow_plaintext_passthrough", &self.allow_plaintext_passthrough)
            .field("listen_port", &self.listen_port)
            .field("log_level", &self.log_level)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("ip_lookup_host", &self.ip_lookup_host)
            .field("ip_lookup_port", &self.ip_lookup_port)
            .field("ip_lookup_path", &self.ip_lookup_path)
            .field("ip_lookup_timeout_ms", &self.ip_lookup_timeout_ms)
            .field("default_page_size", &self.default_page_size)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        match (self.primary_secret(), self.allow_plaintext_passthrough) {
            (None, false) => anyhow::bail!(
                "FIELD_ENCRYPTION_KEY is required unless ALLOW_PLAINTEXT_PASSTHROUGH=true"
            ),
            (Some(_), true) => anyhow::bail!(
                "ALLOW_PLAINTEXT_PASSTHROUGH cannot be combined with FIELD_ENCRYPTION_KEY"
            ),
            _ => {}
        }
        if self.primary_secret().is_none() && !self.retired_secrets().is_empty() {
            anyhow::bail!("PREVIOUS_ENCRYPTION_KEYS requires FIELD_ENCRYPTION_KEY");
        }
        ensure_non_empty(&self.consent_text, "CONSENT_TEXT")?;
        ensure_non_empty(&self.log_level, "LOG_LEVEL")?;

        if !(1..=MAX_PAGE_SIZE).contains(&self.default_page_size) {
            anyhow::bail!("DEFAULT_PAGE_SIZE must be between 1 and {MAX_PAGE_SIZE}");
        }
        if self.ip_lookup_timeout_ms == 0 {
            anyhow::bail!("IP_LOOKUP_TIMEOUT_MS must be > 0");
        }
        if let Some(host) = &self.ip_lookup_host {
            ensure_non_empty(host, "IP_LOOKUP_HOST")?;
            if !self.ip_lookup_path.starts_with('/') {
                anyhow::bail!("IP_LOOKUP_PATH must start with '/'");
            }
        }
        Ok(())
    }

    fn primary_secret(&self) -> Option<&str> {
        self.field_encryption_key
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    fn retired_secrets(&self) -> Vec<&str> {
        self.previous_encryption_keys
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Build the field cipher from the configured secrets.
    ///
    /// # Errors
    ///
    /// Returns an error if a secret cannot be turned into a key.
    pub fn cipher(&self) -> Result<FieldCipher> {
        FieldCipher::from_secrets(
            self.primary_secret(),
            &self.retired_secrets(),
            self.allow_plaintext_passthrough,
        )
        .context("failed to initialise field cipher")
    }

    /// The IP lookup collaborator, if a service is configured.
    pub fn ip_lookup(&self) -> Option<HttpIpLookup> {
        let host = self.ip_lookup_host.as_deref()?;
        Some(HttpIpLookup::new(
            host,
            self.ip_lookup_port,
            self.ip_lookup_path.as_str(),
            Duration::from_millis(self.ip_lookup_timeout_ms),
        ))
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            field_encryption_key: Some("correct horse battery staple".into()),
            previous_encryption_keys: None,
            allow_plaintext_passthrough: false,
            consent_text: default_consent_text(),
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            otel_exporter_otlp_endpoint: None,
            ip_lookup_host: None,
            ip_lookup_port: default_ip_lookup_port(),
            ip_lookup_path: default_ip_lookup_path(),
            ip_lookup_timeout_ms: default_ip_lookup_timeout_ms(),
            default_page_size: default_page_size(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_listen_port(), 8080);
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_ip_lookup_port(), 80);
        assert_eq!(default_ip_lookup_path(), "/");
        assert_eq!(default_ip_lookup_timeout_ms(), 2000);
        assert_eq!(default_page_size(), 20);
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_key() {
        let cfg = Config {
            field_encryption_key: Some("  ".into()),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn passthrough_must_be_explicit_and_exclusive() {
        let dev = Config {
            field_encryption_key: None,
            allow_plaintext_passthrough: true,
            ..base()
        };
        assert!(dev.validate().is_ok());
        assert!(!dev.cipher().unwrap().is_sealed());

        let mixed = Config {
            allow_plaintext_passthrough: true,
            ..base()
        };
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_page_size() {
        for size in [0, MAX_PAGE_SIZE + 1] {
            let cfg = Config {
                default_page_size: size,
                ..base()
            };
            assert!(cfg.validate().is_err(), "page size {size} accepted");
        }
    }

    #[test]
    fn validate_rejects_zero_lookup_timeout() {
        let cfg = Config {
            ip_lookup_timeout_ms: 0,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retired_keys_are_split_on_commas() {
        let cfg = Config {
            previous_encryption_keys: Some("old-one, ,old-two ".into()),
            ..base()
        };
        assert_eq!(cfg.retired_secrets(), vec!["old-one", "old-two"]);
        let cipher = cfg.cipher().unwrap();
        assert!(cipher.is_sealed());
        assert_eq!(cipher.key_count(), 3);
    }

    #[test]
    fn ip_lookup_only_when_host_set() {
        assert!(base().ip_lookup().is_none());
        let cfg = Config {
            ip_lookup_host: Some("ip.internal".into()),
            ..base()
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.ip_lookup().is_some());
    }

    #[test]
    fn debug_redacts_secrets() {
        let rendered = format!("{:?}", base());
        assert!(!rendered.contains("correct horse"));
        assert!(rendered.contains("<redacted>"));
    }
}
