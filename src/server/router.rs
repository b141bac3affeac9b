use crate::handlers::{account, status};
use crate::middleware::session::CookiePolicy;
use crate::platform::TerminalSupport;
use crate::service::AccountService;
use axum::Router;
use axum::extract::FromRef;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct DeskState {
    pub accounts: AccountService,
    pub key: Key,
    pub insecure_cookie: bool,
    pub terminal: TerminalSupport,
}

impl DeskState {
    pub fn new(
        accounts: AccountService,
        secret_key: &str,
        insecure_cookie: bool,
        terminal: TerminalSupport,
    ) -> Self {
        Self {
            accounts,
            key: cookie_key(secret_key),
            insecure_cookie,
            terminal,
        }
    }

    pub fn cookies(&self) -> CookiePolicy {
        CookiePolicy {
            insecure: self.insecure_cookie,
        }
    }
}

impl FromRef<DeskState> for Key {
    fn from_ref(state: &DeskState) -> Self {
        state.key.clone()
    }
}

/// Cookie key derived from `SECRET_KEY`; any secret length is accepted.
pub fn cookie_key(secret: &str) -> Key {
    let digest = Sha512::digest(secret.as_bytes());
    Key::from(digest.as_slice())
}

pub fn desk_router(state: DeskState, request_timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/", get(account::index))
        .route("/login", post(account::login))
        .route("/logout", get(account::logout))
        .route(
            "/signup",
            get(account::signup_form).post(account::signup),
        )
        .route("/register", get(account::register))
        .route("/verify-email", post(account::verify_email))
        .route("/resend-code", post(account::resend_code))
        .route("/forgot-password", post(account::forgot_password))
        .route("/reset-password", post(account::reset_password))
        .route("/resend-reset-code", post(account::resend_reset_code))
        .route("/profile", get(account::profile))
        .route("/api/change_password", post(account::change_password))
        .route(
            "/api/request_password_change_otp",
            post(account::request_password_change),
        )
        .route(
            "/api/verify_password_change_otp",
            post(account::confirm_password_change),
        )
        .route(
            "/api/resend_password_change_otp",
            post(account::resend_password_change_code),
        )
        .route("/status", get(status::status));
    with_service_layers(routes, request_timeout).with_state(state)
}

/// Request timeout (503 once `request_timeout` elapses) and HTTP tracing.
fn with_service_layers<S>(routes: Router<S>, request_timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    routes
        .layer(TimeoutLayer::with_status_code(
            StatusCode::SERVICE_UNAVAILABLE,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}
