use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, Key, PrivateCookieJar, SameSite};
use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::debug;

use crate::DeskError;
use crate::db::models::{Role, UserDoc};

pub const SESSION_COOKIE: &str = "session";
/// E-mail of the signup awaiting verification.
pub const PENDING_COOKIE: &str = "pending_email";
/// E-mail of the account whose password is being reset.
pub const RESET_COOKIE: &str = "reset_email";

const SESSION_TTL: Duration = Duration::days(7);
const FLOW_TTL: Duration = Duration::hours(1);

/// Signed-in user carried in the encrypted `session` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

impl From<&UserDoc> for SessionUser {
    fn from(user: &UserDoc) -> Self {
        Self {
            user_id: user.id_hex(),
            username: user.username.clone(),
            role: user.role,
        }
    }
}

impl SessionUser {
    pub fn from_jar(jar: &PrivateCookieJar) -> Option<Self> {
        let cookie = jar.get(SESSION_COOKIE)?;
        match serde_json::from_str(cookie.value()) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "discarding unreadable session cookie");
                None
            }
        }
    }
}

/// Cookie attributes shared by every cookie this service sets.
#[derive(Debug, Clone, Copy)]
pub struct CookiePolicy {
    pub insecure: bool,
}

impl CookiePolicy {
    pub fn start_session(
        self,
        jar: PrivateCookieJar,
        user: &UserDoc,
    ) -> Result<PrivateCookieJar, DeskError> {
        let value = serde_json::to_string(&SessionUser::from(user))?;
        Ok(jar.add(self.build(SESSION_COOKIE, value, SESSION_TTL)))
    }

    pub fn set_flow(self, jar: PrivateCookieJar, name: &str, email: &str) -> PrivateCookieJar {
        jar.add(self.build(name, email.to_string(), FLOW_TTL))
    }

    pub fn clear(self, jar: PrivateCookieJar, name: &str) -> PrivateCookieJar {
        jar.remove(
            Cookie::build(Cookie::new(name.to_string(), ""))
                .path("/")
                .build(),
        )
    }

    pub fn clear_all(self, jar: PrivateCookieJar) -> PrivateCookieJar {
        [SESSION_COOKIE, PENDING_COOKIE, RESET_COOKIE]
            .into_iter()
            .fold(jar, |jar, name| self.clear(jar, name))
    }

    fn build(self, name: &str, value: String, max_age: Duration) -> Cookie<'static> {
        Cookie::build(Cookie::new(name.to_string(), value))
            .path("/")
            .http_only(true)
            .secure(!self.insecure)
            .same_site(SameSite::Lax)
            .max_age(max_age)
            .build()
    }
}

/// Value of a flow cookie (`pending_email`, `reset_email`), if set.
pub fn flow_email(jar: &PrivateCookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|c| c.value().to_owned())
        .filter(|v| !v.is_empty())
}

/// Rejects the request with 401 unless it carries a valid session cookie.
#[derive(Debug, Clone)]
pub struct RequireSession(pub SessionUser);

impl<S> FromRequestParts<S> for RequireSession
where
    S: Send + Sync,
    Key: FromRef<S>,
{
    type Rejection = DeskError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = PrivateCookieJar::<Key>::from_headers(&parts.headers, Key::from_ref(state));
        SessionUser::from_jar(&jar)
            .map(Self)
            .ok_or(DeskError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::response::IntoResponse;
    use chrono::Utc;

    fn admin() -> UserDoc {
        UserDoc {
            id: None,
            username: "admin".to_string(),
            email: "admin@tradingbot.com".to_string(),
            password_hash: String::new(),
            role: Role::Admin,
            created_at: Utc::now(),
            email_verified: true,
        }
    }

    #[test]
    fn session_cookie_round_trips_through_encryption() {
        let key = Key::generate();
        let policy = CookiePolicy { insecure: false };
        let jar = PrivateCookieJar::new(key.clone());
        let jar = policy.start_session(jar, &admin()).unwrap();

        let response = jar.into_response();
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("session="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
        assert!(!set_cookie.contains("admin"));

        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, pair.parse().unwrap());
        let jar = PrivateCookieJar::from_headers(&headers, key);
        let user = SessionUser::from_jar(&jar).unwrap();
        assert_eq!(user.username, "admin");
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn cookie_sealed_with_another_key_is_ignored() {
        let jar = CookiePolicy { insecure: true }
            .start_session(PrivateCookieJar::new(Key::generate()), &admin())
            .unwrap();
        let response = jar.into_response();
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(!set_cookie.contains("Secure"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, set_cookie.split(';').next().unwrap().parse().unwrap());
        let jar = PrivateCookieJar::from_headers(&headers, Key::generate());
        assert!(SessionUser::from_jar(&jar).is_none());
    }
}
