//! Request and response payloads for the account routes.

use crate::db::models::{Role, UserDoc};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Local part, `@`, domain, and a top-level domain of at least two letters.
static EMAIL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok());

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(email))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    /// Username or e-mail address.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SignupRequest {
    #[serde(default)]
    #[validate(
        length(min = 3, max = 20, message = "Username must be 3 to 20 characters"),
        custom(function = "alphanumeric")
    )]
    pub username: String,
    #[serde(default)]
    #[validate(custom(function = "email_address"))]
    pub email: String,
    #[serde(default)]
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
    #[serde(default)]
    #[validate(must_match(other = "password", message = "Passwords do not match"))]
    pub confirm_password: String,
}

impl SignupRequest {
    /// Field order in which validation failures are reported.
    pub const FIELD_ORDER: [&'static str; 4] = ["username", "email", "password", "confirm_password"];

    pub fn normalized(mut self) -> Self {
        self.username = self.username.trim().to_string();
        self.email = self.email.trim().to_lowercase();
        self
    }

    pub fn has_blank_field(&self) -> bool {
        self.username.is_empty()
            || self.email.is_empty()
            || self.password.is_empty()
            || self.confirm_password.is_empty()
    }
}

fn alphanumeric(username: &str) -> Result<(), ValidationError> {
    if username.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ValidationError::new("alphanumeric")
            .with_message("Username can only contain letters and numbers".into()))
    }
}

fn email_address(email: &str) -> Result<(), ValidationError> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(ValidationError::new("email")
            .with_message("Please enter a valid email address".into()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentPasswordRequest {
    #[serde(default)]
    pub current_password: String,
}

/// Second step of a code-confirmed password change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PasswordChangeConfirmRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

/// Outcome of issuing a one-time code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeIssued {
    pub email: String,
    pub emailed: bool,
    /// Returned when the code could not be e-mailed (development mode,
    /// unconfigured relay or a failed send) so the user can still proceed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&UserDoc> for UserProfile {
    fn from(u: &UserDoc) -> Self {
        Self {
            id: u.id_hex(),
            username: u.username.clone(),
            email: u.email.clone(),
            role: u.role,
            email_verified: u.email_verified,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}
