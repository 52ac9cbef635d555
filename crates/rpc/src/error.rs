use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use piedpiper_auth::{TokenError, UserError};
use piedpiper_catalog::{CatalogError, UploadError};
use piedpiper_types::ErrorKind;
use serde::Serialize;
use std::fmt::Display;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Status code plus client-facing message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Logs `cause` and hides it from the client.
    pub(crate) fn internal(cause: impl Display) -> Self {
        error!("Internal error: {}", cause);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

/// Default status for each error kind. Token and upload errors override a few of
/// these to keep the established wire contract.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Precondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    fn from_kind(kind: ErrorKind, err: impl Display) -> Self {
        if kind.is_internal() {
            return ApiError::internal(err);
        }
        Self::new(status_for(kind), err.to_string())
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        ApiError::from_kind(err.kind(), err)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::StaleRequest { .. } => {
                Self::new(StatusCode::EXPECTATION_FAILED, err.to_string())
            }
            TokenError::InvalidToken(_) => ApiError::not_found("invalid token"),
            TokenError::ExpiredToken => {
                Self::new(StatusCode::PRECONDITION_FAILED, err.to_string())
            }
            TokenError::User(inner) => inner.into(),
            other => ApiError::from_kind(other.kind(), other),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let kind = err.kind();
        match err {
            UploadError::SessionNotFound(_) => {
                Self::new(status_for(kind), "upload session not found")
            }
            UploadError::NotYetUploaded(_) => {
                Self::new(status_for(kind), "object has not been uploaded yet")
            }
            other => ApiError::from_kind(kind, other),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Token(inner) => inner.into(),
            CatalogError::Upload(inner) => inner.into(),
            CatalogError::User(inner) => inner.into(),
            CatalogError::UserNotFound(_) | CatalogError::ObjectNotFound { .. } => {
                ApiError::not_found("object not found")
            }
            other => ApiError::from_kind(other.kind(), other),
        }
    }
}
