//! Axum request handlers for all service endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    BatchConsentRequest, BatchConsentResponse, ErrorResponse, GiveConsentRequest, HealthResponse,
    PageQuery, ProfilePayload, WithdrawConsentRequest,
};
use common::{ConsentEvent, ConsentRecord, ConsentStats, ConsentView, Page, ServiceError};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::middleware::{client_ip, user_agent};
use super::state::AppState;
use crate::ledger::{Caller, GiveConsent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`ServiceError`] rendered as an [`ErrorResponse`] with its status code.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = ErrorResponse::new(self.0.code(), self.0.to_string());
        (status, Json(body)).into_response()
    }
}

fn consent_not_found() -> ApiError {
    ApiError(ServiceError::NotFound(
        "no consent record for this student".into(),
    ))
}

fn resource_not_found() -> ApiError {
    ApiError(ServiceError::NotFound(
        "the requested resource does not exist".into(),
    ))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health`: liveness check reporting the cipher mode.
///
/// Always `200 OK`; the status is `"degraded"` when fields are stored in the
/// clear.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cipher = state.codec.cipher();
    let status = if cipher.is_sealed() { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.into(),
        cipher_mode: cipher.mode_name().into(),
        keys_loaded: cipher.key_count(),
    })
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// `POST /profiles/encrypt`: seal the sensitive attributes of a profile row
/// or update patch before it is written.
///
/// Fails as a whole when any field cannot be sealed.
pub async fn encrypt_profile(
    State(state): State<AppState>,
    _caller: Caller,
    Json(req): Json<ProfilePayload>,
) -> Result<Json<ProfilePayload>, ApiError> {
    let profile = state.codec.encrypt_row(&req.profile).map_err(|e| {
        warn!(error = %e, "profile encryption failed");
        ServiceError::EncryptionFailure("encryption failed".into())
    })?;
    Ok(Json(ProfilePayload { profile }))
}

/// `POST /profiles/decrypt`: open the sensitive attributes of a stored
/// profile row. Unreadable fields come back as `null`.
///
/// Staff may open any row; everyone else only the row whose `id` is their own.
pub async fn decrypt_profile(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ProfilePayload>,
) -> Result<Json<ProfilePayload>, ApiError> {
    let owner = req
        .profile
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| id.parse::<Uuid>().ok());
    if !caller.role.is_staff() && owner != Some(caller.user_id) {
        debug!(caller = %caller.user_id, "profile decryption refused");
        return Err(resource_not_found());
    }
    Ok(Json(ProfilePayload {
        profile: state.codec.decrypt_row(&req.profile),
    }))
}

// ---------------------------------------------------------------------------
// Consents
// ---------------------------------------------------------------------------

/// `GET /consents`: paginated listing for staff.
pub async fn list_consents(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<ConsentView>>, ApiError> {
    let page = query.page.unwrap_or(1);
    let per_page = query.per_page.unwrap_or(state.default_page_size);
    let listing = state.ledger.get_all_consents(&caller, page, per_page).await?;
    Ok(Json(listing))
}

/// `GET /consents/stats`: aggregate counts, staff only.
pub async fn consent_stats(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ConsentStats>, ApiError> {
    if !caller.role.is_staff() {
        return Err(resource_not_found());
    }
    Ok(Json(state.ledger.get_consent_stats().await?))
}

/// `POST /consents/batch`: current consent of several students.
pub async fn batch_consents(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<BatchConsentRequest>,
) -> Result<Json<BatchConsentResponse>, ApiError> {
    let consents = state
        .ledger
        .get_students_consent(&caller, &req.student_ids)
        .await?;
    Ok(Json(BatchConsentResponse { consents }))
}

/// `POST /consents`: record consent for a student.
///
/// `consented_by` defaults to the caller; only staff may record consent on
/// behalf of someone else. A non-staff caller cannot renew a record another
/// user consented on; that record answers as missing.
pub async fn give_consent(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Json(req): Json<GiveConsentRequest>,
) -> Result<Json<ConsentRecord>, ApiError> {
    let consented_by = req.consented_by.unwrap_or(caller.user_id);
    if consented_by != caller.user_id && !caller.role.is_staff() {
        return Err(ApiError(ServiceError::BadRequest(
            "consented_by must be the calling user".into(),
        )));
    }
    if !state.ledger.may_give_consent(&caller, req.student_id).await? {
        return Err(consent_not_found());
    }
    let request = GiveConsent {
        ip_address: client_ip(&headers),
        user_agent: user_agent(&headers),
        ..GiveConsent::new(req.student_id, consented_by)
    };
    Ok(Json(state.ledger.give_consent(request).await?))
}

/// `GET /consents/:student_id`: the student's consent with display names.
pub async fn get_consent(
    State(state): State<AppState>,
    caller: Caller,
    Path(student_id): Path<Uuid>,
) -> Result<Json<ConsentView>, ApiError> {
    state
        .ledger
        .get_student_consent(&caller, student_id)
        .await?
        .map(Json)
        .ok_or_else(consent_not_found)
}

/// `POST /consents/:student_id/withdraw`: withdraw a visible consent. The
/// body is optional.
pub async fn withdraw_consent(
    State(state): State<AppState>,
    caller: Caller,
    Path(student_id): Path<Uuid>,
    body: Option<Json<WithdrawConsentRequest>>,
) -> Result<Json<ConsentRecord>, ApiError> {
    if state
        .ledger
        .get_student_consent(&caller, student_id)
        .await?
        .is_none()
    {
        return Err(consent_not_found());
    }
    let reason = body.and_then(|Json(b)| b.reason);
    let record = state
        .ledger
        .withdraw_consent(student_id, reason.as_deref(), Some(caller.user_id))
        .await?;
    Ok(Json(record))
}

/// `GET /consents/:student_id/history`: consent events, oldest first.
pub async fn consent_history(
    State(state): State<AppState>,
    caller: Caller,
    Path(student_id): Path<Uuid>,
) -> Result<Json<Vec<ConsentEvent>>, ApiError> {
    Ok(Json(state.ledger.consent_history(&caller, student_id).await?))
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
