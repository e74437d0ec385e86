use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::dispatch::DispatchError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn invalid_credentials() -> Self {
        ApiError::Unauthorized("INVALID_CREDENTIALS", "Email or password is incorrect".into())
    }

    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

/// Maps a sqlx failure into a 500, logging the underlying cause.
pub fn db_error(e: sqlx::Error) -> ApiError {
    tracing::error!(error = %e, "database error");
    ApiError::Internal(format!("db error: {e}"))
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let msg = e.to_string();
        match e {
            DispatchError::InvalidTransition { .. } => ApiError::Conflict("INVALID_TRANSITION", msg),
            DispatchError::DuplicateRequest(_) => ApiError::Conflict("DUPLICATE_REQUEST", msg),
            DispatchError::OfferNotHeld => ApiError::Conflict("OFFER_NOT_HELD", msg),
            DispatchError::OfferExpired => ApiError::Conflict("OFFER_EXPIRED", msg),
            DispatchError::NoAmbulancesRemaining => {
                ApiError::Conflict("NO_AMBULANCES_REMAINING", msg)
            }
            DispatchError::NoDriverAssigned => ApiError::Conflict("NO_DRIVER_ASSIGNED", msg),
            DispatchError::InvalidCoordinates(_)
            | DispatchError::InvalidAmbulanceCount(_)
            | DispatchError::InvalidCommission(_)
            | DispatchError::InvalidFare(_) => ApiError::BadRequest("VALIDATION_ERROR", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response("INTERNAL", &msg),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RequestStatus;

    #[test]
    fn dispatch_errors_map_to_conflict_or_bad_request() {
        let resp = ApiError::from(DispatchError::InvalidTransition {
            from: RequestStatus::Completed,
            to: RequestStatus::Accepted,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::from(DispatchError::InvalidCommission(9.0)).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::from(DispatchError::DuplicateRequest("AMB-1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_uses_404() {
        let resp = ApiError::not_found("request").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
