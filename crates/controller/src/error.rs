use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::store::StoreError;

/// Typed errors reported across all controller components.
///
/// Protocol adapters translate these to HTTP statuses, WebSocket close codes,
/// or `*_reject` / `*_nack` frames. Messages never leak database identifiers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("bootstrap PIN already claimed")]
    AlreadyClaimed,
    #[error("token expired")]
    TokenExpired,
    #[error("token invalid")]
    TokenInvalid,
    #[error("password required")]
    PasswordRequired,
    #[error("invalid password")]
    InvalidPassword,
    #[error("share link expired")]
    LinkExpired,
    #[error("insufficient role for this action")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed at {field}: {message}")]
    Validation { field: String, message: String },
    #[error("send queue saturated")]
    Backpressure,
    #[error("connection superseded by a newer one")]
    Superseded,
    #[error("too many pending speedtest requests")]
    TooManyPending,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("transient downstream failure: {0}")]
    Transient(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code included in every rejection.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidCredentials => "invalid_credentials",
            Error::AlreadyClaimed => "already_claimed",
            Error::TokenExpired => "token_expired",
            Error::TokenInvalid => "token_invalid",
            Error::PasswordRequired => "PASSWORD_REQUIRED",
            Error::InvalidPassword => "INVALID_PASSWORD",
            Error::LinkExpired => "LINK_EXPIRED",
            Error::Forbidden => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Validation { .. } => "validation",
            Error::Backpressure => "backpressure",
            Error::Superseded => "superseded",
            Error::TooManyPending => "too_many_pending",
            Error::Cancelled => "cancelled",
            Error::Timeout => "timeout",
            Error::Transient(_) => "transient",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidCredentials
            | Error::TokenExpired
            | Error::TokenInvalid
            | Error::PasswordRequired
            | Error::InvalidPassword
            | Error::LinkExpired => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyClaimed | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::TooManyPending => StatusCode::TOO_MANY_REQUESTS,
            Error::Backpressure | Error::Superseded => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled | Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Transient(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Error::Conflict(msg),
            StoreError::Unavailable(msg) => Error::Transient(msg),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
