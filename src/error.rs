use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Invalid or malformed token")]
    InvalidToken,
    #[error("Session not found")]
    TokenNotFound,
    #[error("Session has been revoked")]
    TokenRevoked,
    #[error("Session has expired")]
    TokenExpired,
    #[error("Account is not verified")]
    AccountNotVerified,
    #[error("Password has not been set for this account")]
    PasswordNotSet,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("Internal server error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Stable machine-readable code; the programmatic contract for clients.
    /// Messages may change, codes must not.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::AccountNotVerified => "ACCOUNT_NOT_VERIFIED",
            Self::PasswordNotSet => "PASSWORD_NOT_SET",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Database(_) | Self::Internal => "INTERNAL_ERROR",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials
            | Self::InvalidToken
            | Self::TokenNotFound
            | Self::TokenRevoked
            | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::AccountNotVerified | Self::PasswordNotSet | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Database(_) | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        match &self {
            Self::Database(e) => tracing::error!(error = %e, "Database error"),
            Self::Internal => tracing::error!("Internal server error occurred"),
            Self::RateLimited { retry_after_secs } => {
                tracing::warn!(retry_after = retry_after_secs, "Request throttled");
            }
            other => tracing::debug!(code, error = %other, "Request rejected"),
        }

        // Persistence failures never leak their message to the caller.
        let message = match &self {
            Self::Database(_) | Self::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = if let Self::RateLimited { retry_after_secs } = &self {
            json!({ "error": message, "code": code, "retryAfter": retry_after_secs })
        } else {
            json!({ "error": message, "code": code })
        };

        (status, Json(body)).into_response()
    }
}
