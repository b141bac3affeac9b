use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::error;

#[derive(Debug, ThisError)]
pub enum DeskError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid username/email or password")]
    InvalidCredentials,

    #[error("Not logged in")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid {0} code")]
    CodeInvalid(CodeKind),

    #[error("The {0} code has expired")]
    CodeExpired(CodeKind),

    #[error("This {0} code has already been used")]
    CodeUsed(CodeKind),

    #[error("Too many requests; try again later")]
    RateLimited,

    #[error("Invalid mail address: {0}")]
    MailAddress(String),

    #[error("Mail delivery failed: {0}")]
    MailDelivery(String),

    #[error("Mail delivery timed out after {0} seconds")]
    MailTimeout(u64),

    #[error("Password hash error: {0}")]
    PasswordHash(String),
}

/// Which one-time code a code error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Verification,
    Reset,
    PasswordChange,
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeKind::Verification => write!(f, "verification"),
            CodeKind::Reset => write!(f, "reset"),
            CodeKind::PasswordChange => write!(f, "password change"),
        }
    }
}

impl From<figment::Error> for DeskError {
    fn from(e: figment::Error) -> Self {
        DeskError::Config(Box::new(e))
    }
}

impl IntoResponse for DeskError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self {
            DeskError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            DeskError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
            DeskError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            DeskError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            DeskError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            DeskError::CodeInvalid(_) => (StatusCode::BAD_REQUEST, "CODE_INVALID"),
            DeskError::CodeExpired(_) => (StatusCode::BAD_REQUEST, "CODE_EXPIRED"),
            DeskError::CodeUsed(_) => (StatusCode::BAD_REQUEST, "CODE_USED"),
            DeskError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT"),
            DeskError::MailAddress(_) | DeskError::MailDelivery(_) => {
                (StatusCode::BAD_GATEWAY, "MAIL_FAILED")
            }
            DeskError::MailTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "MAIL_TIMEOUT"),
            DeskError::Config(_)
            | DeskError::Database(_)
            | DeskError::Json(_)
            | DeskError::PasswordHash(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "An internal server error occurred.".to_string()
        } else {
            self.to_string()
        };

        let body = ApiErrorResponse {
            error: ApiErrorBody {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}
