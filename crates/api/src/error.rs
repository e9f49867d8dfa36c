//! HTTP error mapping
//!
//! Translates engine errors into status codes without leaking internals:
//! everything that is not an explicit client fault collapses to a generic
//! 500 body, with the detail kept in the server log.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use recoup_recovery::RecoveryError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("case does not belong to the authenticated merchant")]
    Forbidden,

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Missing or invalid API key".to_string(),
                None,
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "Case does not belong to this merchant".to_string(),
                None,
            ),
            ApiError::Recovery(err) => match err {
                RecoveryError::Verification(e) => {
                    (StatusCode::BAD_REQUEST, format!("Invalid signature: {e}"), None)
                }
                RecoveryError::MalformedEvent(e) => {
                    (StatusCode::BAD_REQUEST, format!("Malformed event: {e}"), None)
                }
                RecoveryError::CaseNotFound(_)
                | RecoveryError::AttemptNotFound(_)
                | RecoveryError::TemplateNotFound(_) => {
                    (StatusCode::NOT_FOUND, err.to_string(), None)
                }
                RecoveryError::InvalidCaseStatus { .. }
                | RecoveryError::IllegalTransition { .. } => {
                    (StatusCode::CONFLICT, err.to_string(), None)
                }
                RecoveryError::ManualRetryLimit { retry_after_secs } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    err.to_string(),
                    Some(*retry_after_secs),
                ),
                RecoveryError::MissingInvoiceId(_) | RecoveryError::MissingContact(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, err.to_string(), None)
                }
                other => {
                    tracing::error!(error = %other, "Request failed with internal error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                        None,
                    )
                }
            },
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn not_found_maps_to_404() {
        let response =
            ApiError::Recovery(RecoveryError::CaseNotFound(Uuid::new_v4())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn manual_cap_maps_to_429_with_retry_after() {
        let response = ApiError::Recovery(RecoveryError::ManualRetryLimit {
            retry_after_secs: 3600,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "3600"
        );
    }

    #[test]
    fn terminal_status_maps_to_409() {
        let response = ApiError::Recovery(RecoveryError::InvalidCaseStatus {
            case_id: Uuid::new_v4(),
            status: "recovered".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_detail_not_leaked() {
        let response =
            ApiError::Recovery(RecoveryError::Vault("nonce mismatch".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
