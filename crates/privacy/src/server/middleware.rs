//! Axum middleware layers and request-context extraction.
//!
//! Includes request tracing, timeout enforcement, and response compression,
//! plus the caller identity and client metadata read from request headers.

use std::net::IpAddr;
use std::time::Duration;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use common::{Role, ServiceError};
use uuid::Uuid;

use super::handlers::ApiError;
use crate::ledger::Caller;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller id header set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Caller role header set by the upstream auth layer.
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers).map_err(ApiError)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ServiceError> {
    let user_id = header_str(headers, USER_ID_HEADER)
        .ok_or_else(|| ServiceError::Unauthorized("missing X-User-Id header".into()))?
        .parse::<Uuid>()
        .map_err(|_| ServiceError::Unauthorized("X-User-Id is not a valid user id".into()))?;
    let role = header_str(headers, USER_ROLE_HEADER)
        .ok_or_else(|| ServiceError::Unauthorized("missing X-User-Role header".into()))?
        .parse::<Role>()
        .map_err(|_| ServiceError::Unauthorized("X-User-Role is not a known role".into()))?;
    Ok(Caller::new(user_id, role))
}

/// First valid address of `X-Forwarded-For`, else `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = header_str(headers, "x-forwarded-for").and_then(|v| v.split(',').next());
    forwarded
        .into_iter()
        .chain(header_str(headers, "x-real-ip"))
        .find_map(|v| v.trim().parse::<IpAddr>().ok())
        .map(|ip| ip.to_string())
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::USER_AGENT.as_str()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_headers_are_parsed() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, id.to_string().parse().unwrap());
        headers.insert(USER_ROLE_HEADER, " Teacher ".parse().unwrap());
        assert_eq!(caller_from_headers(&headers).unwrap(), Caller::new(id, Role::Teacher));

        headers.insert(USER_ROLE_HEADER, "janitor".parse().unwrap());
        assert!(matches!(
            caller_from_headers(&headers),
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(caller_from_headers(&HeaderMap::new()).is_err());
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("198.51.100.2"));

        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.5"));

        headers.insert("x-forwarded-for", "unknown".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("198.51.100.2"));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
