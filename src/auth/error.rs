//! Access Errors
//! Mission: One taxonomy for every authentication and abuse-prevention failure

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Token-level validation failures (signature and time bounds only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("missing or malformed authorization header, use: Bearer <token>")]
    MissingToken,
    #[error("account locked due to too many failed login attempts")]
    AccountLocked,
    #[error("token has expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("password has been changed, please login again")]
    PasswordChanged,
    #[error("username already exists")]
    UsernameExists,
    #[error("registration is currently disabled")]
    RegistrationDisabled,
    #[error("too many requests, please try again later")]
    RateLimited,
    #[error("old password is incorrect")]
    InvalidPassword,
    #[error("user not found")]
    UserNotFound,
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("{0}")]
    InvalidInput(String),
    #[error("insufficient permissions")]
    Forbidden,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<TokenError> for AccessError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => AccessError::Expired,
            TokenError::Invalid => AccessError::Invalid,
        }
    }
}

impl AccessError {
    pub fn status(&self) -> StatusCode {
        match self {
            AccessError::InvalidCredentials
            | AccessError::MissingToken
            | AccessError::Expired
            | AccessError::Invalid
            | AccessError::PasswordChanged
            | AccessError::InvalidPassword
            | AccessError::UserNotFound => StatusCode::UNAUTHORIZED,
            AccessError::AccountLocked | AccessError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AccessError::UsernameExists => StatusCode::CONFLICT,
            AccessError::RegistrationDisabled | AccessError::Forbidden => StatusCode::FORBIDDEN,
            AccessError::WeakPassword(_) | AccessError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AccessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::InvalidCredentials => "invalid_credentials",
            AccessError::MissingToken => "missing_token",
            AccessError::AccountLocked => "account_locked",
            AccessError::Expired => "token_expired",
            AccessError::Invalid => "invalid_token",
            AccessError::PasswordChanged => "password_changed",
            AccessError::UsernameExists => "username_exists",
            AccessError::RegistrationDisabled => "registration_disabled",
            AccessError::RateLimited => "rate_limit_exceeded",
            AccessError::InvalidPassword => "invalid_password",
            AccessError::UserNotFound => "user_not_found",
            AccessError::WeakPassword(_) => "weak_password",
            AccessError::InvalidInput(_) => "invalid_input",
            AccessError::Forbidden => "forbidden",
            AccessError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        if let AccessError::Internal(ref e) = self {
            error!("Internal error: {:#}", e);
        }

        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        match self {
            AccessError::AccountLocked | AccessError::RateLimited => {
                (status, [(header::RETRY_AFTER, "60")], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
