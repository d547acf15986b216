// =============================================================================
// Operator Authentication — Axum bearer extractor
// =============================================================================
//
// The control surface is the local transport the operator channel adapter
// calls into, so every command endpoint requires the operator token from
// `POLYEDGE_ADMIN_TOKEN`. Comparison is constant time. A missing or empty
// server-side token rejects everything: there is no unauthenticated mode.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::config::constant_time_eq;

/// Extractor yielding the validated operator token. Rejections short-
/// circuit with 403 before the handler runs.
pub struct OperatorAuth(pub String);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("POLYEDGE_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("POLYEDGE_ADMIN_TOKEN is not set — rejecting all operator requests");
            return Err(AuthRejection {
                message: "operator authentication not configured",
            });
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(OperatorAuth(token.to_string()))
            }
            _ => {
                warn!("operator request with missing or invalid token");
                Err(AuthRejection {
                    message: "invalid operator token",
                })
            }
        }
    }
}
