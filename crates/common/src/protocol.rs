//! Request and response bodies of the HTTP adapter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consent::ConsentRecord;

// ---------------------------------------------------------------------------
// Profile endpoints
// ---------------------------------------------------------------------------

/// Request and response body for `POST /profiles/encrypt` and
/// `POST /profiles/decrypt`.
///
/// `profile` is a full profile row or a partial update patch. Only the
/// sensitive keys present in it are transformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePayload {
    pub profile: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Consent endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /consents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiveConsentRequest {
    pub student_id: Uuid,
    /// Defaults to the calling user when omitted.
    #[serde(default)]
    pub consented_by: Option<Uuid>,
}

/// Request body for `POST /consents/:student_id/withdraw`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawConsentRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `POST /consents/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConsentRequest {
    pub student_ids: Vec<Uuid>,
}

/// Response body for `POST /consents/batch`, keyed by student id. Students
/// without a visible record are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConsentResponse {
    pub consents: HashMap<Uuid, ConsentRecord>,
}

/// Query string of `GET /consents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// `"sealed"` when a key is configured, `"passthrough"` otherwise.
    pub cipher_mode: String,
    /// Number of keys able to decrypt (primary plus retired).
    pub keys_loaded: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn give_consent_defaults_consenter() {
        let req: GiveConsentRequest =
            serde_json::from_value(json!({"student_id": Uuid::nil()})).unwrap();
        assert!(req.consented_by.is_none());
    }

    #[test]
    fn withdraw_accepts_empty_body() {
        let req: WithdrawConsentRequest = serde_json::from_str("{}").unwrap();
        assert!(req.reason.is_none());
    }

    #[test]
    fn error_response_new() {
        let e = ErrorResponse::new("not_found", "consent not found");
        assert_eq!(e.code, "not_found");
        assert!(e.message.contains("consent"));
    }
}
