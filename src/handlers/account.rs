use crate::middleware::session::{
    PENDING_COOKIE, RESET_COOKIE, RequireSession, SessionUser, flow_email,
};
use crate::types::account::{
    ActionResponse, ChangePasswordRequest, CodeIssued, CodeRequest, CurrentPasswordRequest,
    EmailRequest, LoginRequest, PasswordChangeConfirmRequest, ResetPasswordRequest, SignupRequest,
    UserProfile,
};
use crate::{DeskError, server::DeskState};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect},
};
use axum_extra::extract::cookie::PrivateCookieJar;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct SessionStarted {
    pub success: bool,
    pub message: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct CodeSent {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub issued: CodeIssued,
}

impl CodeSent {
    fn new(message: &str, issued: CodeIssued) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            issued,
        }
    }
}

/// Same shape whether or not the address has an account.
#[derive(Debug, Serialize)]
pub struct ResetRequested {
    pub success: bool,
    pub message: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_code: Option<String>,
}

/// GET / -> who is signed in.
pub async fn index(jar: PrivateCookieJar) -> Result<Json<SessionUser>, DeskError> {
    SessionUser::from_jar(&jar)
        .map(Json)
        .ok_or(DeskError::Unauthorized)
}

/// POST /login -> accepts username or e-mail.
pub async fn login(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, DeskError> {
    let user = state.accounts.login(&req.username, &req.password).await?;
    let jar = state.cookies().start_session(jar, &user)?;
    let body = SessionStarted {
        success: true,
        message: format!("Welcome back, {}!", user.username),
        user: UserProfile::from(&user),
    };
    Ok((jar, Json(body)))
}

/// GET /logout
pub async fn logout(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
) -> impl IntoResponse {
    if let Some(user) = SessionUser::from_jar(&jar) {
        info!(username = %user.username, "user logged out");
    }
    let jar = state.cookies().clear_all(jar);
    (jar, Json(ActionResponse::ok("You have been logged out.")))
}

/// GET /register -> legacy alias.
pub async fn register() -> Redirect {
    Redirect::to("/signup")
}

/// GET /signup -> field rules for clients building the form.
pub async fn signup_form() -> Json<Value> {
    Json(json!({
        "fields": SignupRequest::FIELD_ORDER,
        "username": "3 to 20 letters or digits",
        "password_min_length": 6,
    }))
}

/// POST /signup -> stores a pending registration and sends the code.
pub async fn signup(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, DeskError> {
    let (issued, _username) = state.accounts.signup(req).await?;
    let jar = state.cookies().set_flow(jar, PENDING_COOKIE, &issued.email);
    let message = if issued.emailed {
        "Verification code sent to your email. Please check your inbox."
    } else {
        "Account pending verification. Use the code provided to continue."
    };
    Ok((StatusCode::CREATED, jar, Json(CodeSent::new(message, issued))))
}

/// POST /verify-email -> creates the account and signs it in.
pub async fn verify_email(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    Json(req): Json<CodeRequest>,
) -> Result<impl IntoResponse, DeskError> {
    let email = pending_email(&jar)?;
    let user = state.accounts.verify_signup(&email, &req.code).await?;
    let cookies = state.cookies();
    let jar = cookies.clear(jar, PENDING_COOKIE);
    let jar = cookies.start_session(jar, &user)?;
    let body = SessionStarted {
        success: true,
        message: "Email verified successfully! Welcome to TradingBot.".to_string(),
        user: UserProfile::from(&user),
    };
    Ok((jar, Json(body)))
}

/// POST /resend-code
pub async fn resend_code(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
) -> Result<Json<CodeSent>, DeskError> {
    let email = pending_email(&jar)?;
    let issued = state.accounts.resend_signup_code(&email).await?;
    Ok(Json(CodeSent::new("A new verification code has been sent.", issued)))
}

/// POST /forgot-password
pub async fn forgot_password(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    Json(req): Json<EmailRequest>,
) -> Result<impl IntoResponse, DeskError> {
    let issued = state.accounts.forgot_password(&req.email).await?;
    let email = req.email.trim().to_lowercase();
    let jar = state.cookies().set_flow(jar, RESET_COOKIE, &email);
    let body = ResetRequested {
        success: true,
        message: "If an account exists for this email, a reset code has been sent.".to_string(),
        email,
        dev_code: issued.and_then(|i| i.dev_code),
    };
    Ok((jar, Json(body)))
}

/// POST /reset-password
pub async fn reset_password(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse, DeskError> {
    let email = reset_email(&jar)?;
    state.accounts.reset_password(&email, &req).await?;
    let jar = state.cookies().clear(jar, RESET_COOKIE);
    Ok((
        jar,
        Json(ActionResponse::ok(
            "Password reset successfully. Please log in with your new password.",
        )),
    ))
}

/// POST /resend-reset-code
pub async fn resend_reset_code(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
) -> Result<Json<CodeSent>, DeskError> {
    let email = reset_email(&jar)?;
    let issued = state.accounts.resend_reset_code(&email).await?;
    Ok(Json(CodeSent::new("A new reset code has been sent.", issued)))
}

/// GET /profile. A session whose account is gone is cleared and answered
/// with 401 so the client returns to the login screen.
pub async fn profile(
    State(state): State<DeskState>,
    jar: PrivateCookieJar,
    RequireSession(session): RequireSession,
) -> Result<Json<UserProfile>, (PrivateCookieJar, DeskError)> {
    match state.accounts.profile(&session.username).await {
        Ok(user) => Ok(Json(UserProfile::from(&user))),
        Err(DeskError::NotFound(_)) => {
            warn!(username = %session.username, "session refers to a missing account; clearing it");
            Err((state.cookies().clear_all(jar), DeskError::Unauthorized))
        }
        Err(e) => Err((jar, e)),
    }
}

/// POST /api/change_password
pub async fn change_password(
    State(state): State<DeskState>,
    RequireSession(session): RequireSession,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ActionResponse>, DeskError> {
    state
        .accounts
        .change_password(&session.username, &req)
        .await?;
    Ok(Json(ActionResponse::ok("Password changed successfully!")))
}

/// POST /api/request_password_change_otp
pub async fn request_password_change(
    State(state): State<DeskState>,
    RequireSession(session): RequireSession,
    Json(req): Json<CurrentPasswordRequest>,
) -> Result<Json<CodeSent>, DeskError> {
    let issued = state
        .accounts
        .request_password_change(&session.username, &req.current_password)
        .await?;
    Ok(Json(CodeSent::new("Verification code sent to your email.", issued)))
}

/// POST /api/verify_password_change_otp
pub async fn confirm_password_change(
    State(state): State<DeskState>,
    RequireSession(session): RequireSession,
    Json(req): Json<PasswordChangeConfirmRequest>,
) -> Result<Json<ActionResponse>, DeskError> {
    state
        .accounts
        .confirm_password_change(&session.username, &req)
        .await?;
    Ok(Json(ActionResponse::ok("Password changed successfully!")))
}

/// POST /api/resend_password_change_otp
pub async fn resend_password_change_code(
    State(state): State<DeskState>,
    RequireSession(session): RequireSession,
) -> Result<Json<CodeSent>, DeskError> {
    let issued = state
        .accounts
        .resend_password_change_code(&session.username)
        .await?;
    Ok(Json(CodeSent::new(
        "A new verification code has been sent to your email.",
        issued,
    )))
}

fn pending_email(jar: &PrivateCookieJar) -> Result<String, DeskError> {
    flow_email(jar, PENDING_COOKIE).ok_or_else(|| {
        DeskError::Validation("No pending registration. Please sign up again.".to_string())
    })
}

fn reset_email(jar: &PrivateCookieJar) -> Result<String, DeskError> {
    flow_email(jar, RESET_COOKIE).ok_or_else(|| {
        DeskError::Validation(
            "No password reset in progress. Please request a new code.".to_string(),
        )
    })
}
