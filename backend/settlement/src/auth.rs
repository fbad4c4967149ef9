//! Caller identity as asserted by the authenticating gateway.
//!
//! Authentication and KYC happen upstream. The gateway forwards each request
//! with:
//!
//! * `x-gateway-token`: the shared secret from `GATEWAY_TOKEN`,
//! * `x-owner-id`: the authenticated user's numeric id,
//! * `x-owner-role`: `admin` for operators, absent otherwise.
//!
//! A request without a valid token and owner id is rejected; there is no
//! fallback identity.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::api::{ApiState, ErrorResponse};

pub const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";
pub const OWNER_ID_HEADER: &str = "x-owner-id";
pub const OWNER_ROLE_HEADER: &str = "x-owner-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub owner_id: i64,
    pub is_admin: bool,
}

/// An [`Identity`] that holds the admin role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admin(pub Identity);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Unauthorized(&'static str),
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, "unauthorized", reason),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "admin privileges required",
            ),
        };
        (
            status,
            Json(ErrorResponse {
                error: message.to_string(),
                code,
                retryable: false,
            }),
        )
            .into_response()
    }
}

/// Resolve the caller from gateway headers.
pub fn identify(headers: &HeaderMap, gateway_token: &str) -> Result<Identity, AuthError> {
    let presented = headers
        .get(GATEWAY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Unauthorized("missing gateway token"))?;
    if !bool::from(presented.as_bytes().ct_eq(gateway_token.as_bytes())) {
        return Err(AuthError::Unauthorized("invalid gateway token"));
    }

    let owner_id = headers
        .get(OWNER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or(AuthError::Unauthorized("missing or invalid owner id"))?;

    let is_admin = headers
        .get(OWNER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|role| role.eq_ignore_ascii_case("admin"));

    Ok(Identity { owner_id, is_admin })
}

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for Identity {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        identify(&parts.headers, &state.gateway_token).map_err(|e| {
            warn!(path = %parts.uri.path(), "Rejected request: {e:?}");
            e
        })
    }
}

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for Admin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_request_parts(parts, state).await?;
        if !identity.is_admin {
            warn!(owner_id = identity.owner_id, path = %parts.uri.path(), "Admin route refused");
            return Err(AuthError::Forbidden);
        }
        Ok(Admin(identity))
    }
}
