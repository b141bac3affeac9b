use crate::config::{
    Config, DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USERNAME,
};
use crate::db::models::{PasswordChangeOtp, PasswordReset, PendingVerification, Role, UserDoc};
use crate::db::store::AccountStore;
use crate::error::{CodeKind, DeskError};
use crate::mail::templates;
use crate::mail::{Mailer, OutgoingMail};
use crate::service::codes;
use crate::service::password::{hash_password, verify_password};
use crate::types::account::{
    ChangePasswordRequest, CodeIssued, PasswordChangeConfirmRequest, ResetPasswordRequest,
    SignupRequest, is_valid_email,
};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationErrors};

const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Debug, Clone)]
pub struct AccountSettings {
    pub verification_expiry_secs: u64,
    pub reset_expiry_secs: u64,
    pub change_expiry_secs: u64,
    pub hash_iterations: u32,
    pub mail_rate_per_minute: u32,
}

impl AccountSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            verification_expiry_secs: cfg.verification_code_expiry,
            reset_expiry_secs: cfg.reset_code_expiry,
            change_expiry_secs: cfg.password_change_code_expiry,
            hash_iterations: cfg.password_hash_iterations,
            mail_rate_per_minute: cfg.mail_rate_per_minute,
        }
    }
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Account lifecycle: default admin, login, signup with e-mailed code,
/// password reset and change.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    mailer: Mailer,
    settings: AccountSettings,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
}

impl AccountService {
    pub fn new(store: Arc<dyn AccountStore>, mailer: Mailer, settings: AccountSettings) -> Self {
        let per_minute = NonZeroU32::new(settings.mail_rate_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)));
        Self {
            store,
            mailer,
            settings,
            limiter,
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Creates `admin`/`admin123` when no `admin` user exists.
    pub async fn seed_default_admin(&self) -> Result<bool, DeskError> {
        if self
            .store
            .find_user_by_username(DEFAULT_ADMIN_USERNAME)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let admin = UserDoc {
            id: None,
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            email: DEFAULT_ADMIN_EMAIL.to_string(),
            password_hash: self.hash_secret(DEFAULT_ADMIN_PASSWORD).await?,
            role: Role::Admin,
            created_at: Utc::now(),
            email_verified: true,
        };
        match self.store.insert_user(admin).await {
            Ok(_) => {
                warn!(
                    username = DEFAULT_ADMIN_USERNAME,
                    "default admin account created with the stock password; rotate it before production use"
                );
                Ok(true)
            }
            Err(DeskError::Conflict(reason)) => {
                warn!(%reason, "default admin not created");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<UserDoc, DeskError> {
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(DeskError::Validation("Please fill in all fields".to_string()));
        }
        let Some(user) = self.store.find_user_by_login(login).await? else {
            debug!(login, "login for unknown account");
            return Err(DeskError::InvalidCredentials);
        };
        if !self.check_secret(&user.password_hash, password).await? {
            debug!(username = %user.username, "login with wrong password");
            return Err(DeskError::InvalidCredentials);
        }
        info!(username = %user.username, role = %user.role, "user logged in");
        Ok(user)
    }

    pub async fn signup(&self, req: SignupRequest) -> Result<(CodeIssued, String), DeskError> {
        let req = req.normalized();
        if req.has_blank_field() {
            return Err(DeskError::Validation("Please fill in all fields".to_string()));
        }
        if let Err(errors) = req.validate() {
            return Err(first_violation(&errors, &SignupRequest::FIELD_ORDER));
        }
        if self.store.find_user_by_username(&req.username).await?.is_some() {
            return Err(DeskError::Conflict("Username already exists".to_string()));
        }
        if self.store.find_user_by_email(&req.email).await?.is_some() {
            return Err(DeskError::Conflict("Email already exists".to_string()));
        }
        self.check_rate(&req.email)?;

        let password_hash = self.hash_secret(&req.password).await?;
        let code = codes::generate_code();
        let now = Utc::now();
        self.store
            .put_pending(PendingVerification {
                username: req.username.clone(),
                email: req.email.clone(),
                password_hash,
                code: code.clone(),
                created_at: now,
                expires_at: expiry_after(now, self.settings.verification_expiry_secs),
            })
            .await?;
        info!(username = %req.username, email = %req.email, "signup pending verification");

        let issued = self
            .dispatch_verification(&req.email, &req.username, &code)
            .await;
        Ok((issued, req.username))
    }

    /// Turns a pending signup into a user when `code` matches and is live.
    pub async fn verify_signup(&self, email: &str, code: &str) -> Result<UserDoc, DeskError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(DeskError::Validation(
                "Please enter the verification code".to_string(),
            ));
        }
        if !codes::is_well_formed(code) {
            return Err(DeskError::Validation(
                "Invalid code format. Please enter the 6-digit code.".to_string(),
            ));
        }

        let pending = self
            .store
            .find_pending(email)
            .await?
            .filter(|p| codes_match(&p.code, code))
            .ok_or(DeskError::CodeInvalid(CodeKind::Verification))?;
        if pending.is_expired(Utc::now()) {
            return Err(DeskError::CodeExpired(CodeKind::Verification));
        }

        if self
            .store
            .find_user_by_username(&pending.username)
            .await?
            .is_some()
        {
            self.store.delete_pending(email).await?;
            return Err(DeskError::Conflict(
                "Username has already been taken. Please sign up again with a different username."
                    .to_string(),
            ));
        }
        if self.store.find_user_by_email(&pending.email).await?.is_some() {
            self.store.delete_pending(email).await?;
            return Err(DeskError::Conflict(
                "Email has already been registered. Please login or use a different email."
                    .to_string(),
            ));
        }

        let user = UserDoc {
            id: None,
            username: pending.username,
            email: pending.email,
            password_hash: pending.password_hash,
            role: Role::User,
            created_at: Utc::now(),
            email_verified: true,
        };
        let inserted = self.store.insert_user(user).await;
        self.store.delete_pending(email).await?;
        let user = inserted?;
        info!(username = %user.username, "account verified and created");
        Ok(user)
    }

    pub async fn resend_signup_code(&self, email: &str) -> Result<CodeIssued, DeskError> {
        let Some(pending) = self.store.find_pending(email).await? else {
            return Err(DeskError::NotFound(
                "No pending registration found for this email".to_string(),
            ));
        };
        self.check_rate(email)?;

        let code = codes::generate_code();
        let now = Utc::now();
        let expires_at = expiry_after(now, self.settings.verification_expiry_secs);
        if !self
            .store
            .update_pending_code(email, &code, now, expires_at)
            .await?
        {
            return Err(DeskError::NotFound(
                "No pending registration found for this email".to_string(),
            ));
        }
        Ok(self
            .dispatch_verification(email, &pending.username, &code)
            .await)
    }

    /// Issues a reset code when an account exists for `email`. `None` means
    /// no account; callers answer identically in both cases, including once
    /// the address hits the rate limit.
    pub async fn forgot_password(&self, email: &str) -> Result<Option<CodeIssued>, DeskError> {
        let email = normalize_email(email)?;
        self.check_rate(&email)?;
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            debug!(%email, "password reset requested for unknown address");
            return Ok(None);
        };
        self.issue_reset(&user).await.map(Some)
    }

    pub async fn resend_reset_code(&self, email: &str) -> Result<CodeIssued, DeskError> {
        let Some(user) = self.store.find_user_by_email(email).await? else {
            return Err(DeskError::NotFound(
                "No account found with this email".to_string(),
            ));
        };
        self.check_rate(&user.email)?;
        self.issue_reset(&user).await
    }

    pub async fn reset_password(
        &self,
        email: &str,
        req: &ResetPasswordRequest,
    ) -> Result<(), DeskError> {
        let code = req.code.trim();
        if code.is_empty() {
            return Err(DeskError::Validation("Please enter the reset code".to_string()));
        }
        if !codes::is_well_formed(code) {
            return Err(DeskError::Validation("Invalid code format".to_string()));
        }
        if req.new_password.is_empty() {
            return Err(DeskError::Validation("Please enter a new password".to_string()));
        }
        check_password_length(&req.new_password, "Password")?;
        if req.new_password != req.confirm_password {
            return Err(DeskError::Validation("Passwords do not match".to_string()));
        }

        let reset = self
            .store
            .find_reset(email, code)
            .await?
            .ok_or(DeskError::CodeInvalid(CodeKind::Reset))?;
        if reset.used {
            return Err(DeskError::CodeUsed(CodeKind::Reset));
        }
        if reset.is_expired(Utc::now()) {
            return Err(DeskError::CodeExpired(CodeKind::Reset));
        }

        let hash = self.hash_secret(&req.new_password).await?;
        if !self.store.update_password_by_email(email, &hash).await? {
            return Err(DeskError::NotFound(
                "Failed to update password. User not found.".to_string(),
            ));
        }
        self.store.mark_reset_used(email, code).await?;
        info!(%email, "password reset completed");
        Ok(())
    }

    /// Password change for a signed-in user; requires the current password.
    pub async fn change_password(
        &self,
        username: &str,
        req: &ChangePasswordRequest,
    ) -> Result<(), DeskError> {
        if req.current_password.is_empty()
            || req.new_password.is_empty()
            || req.confirm_password.is_empty()
        {
            return Err(DeskError::Validation("All fields are required".to_string()));
        }
        if req.new_password != req.confirm_password {
            return Err(DeskError::Validation("New passwords do not match".to_string()));
        }
        let Some(user) = self.store.find_user_by_username(username).await? else {
            return Err(DeskError::NotFound("User not found".to_string()));
        };
        if !self
            .check_secret(&user.password_hash, &req.current_password)
            .await?
        {
            return Err(DeskError::Validation(
                "Current password is incorrect".to_string(),
            ));
        }
        check_password_length(&req.new_password, "New password")?;
        if req.current_password == req.new_password {
            return Err(DeskError::Validation(
                "New password must be different from current password".to_string(),
            ));
        }

        let hash = self.hash_secret(&req.new_password).await?;
        if !self.store.update_password_by_username(username, &hash).await? {
            return Err(DeskError::NotFound("Failed to update password".to_string()));
        }
        info!(username, "password changed");
        Ok(())
    }

    /// First step of the e-mail confirmed password change: checks the
    /// current password and mails a code to the account's address.
    pub async fn request_password_change(
        &self,
        username: &str,
        current_password: &str,
    ) -> Result<CodeIssued, DeskError> {
        if current_password.is_empty() {
            return Err(DeskError::Validation(
                "Current password is required".to_string(),
            ));
        }
        let Some(user) = self.store.find_user_by_username(username).await? else {
            return Err(DeskError::NotFound("User not found".to_string()));
        };
        if !self
            .check_secret(&user.password_hash, current_password)
            .await?
        {
            return Err(DeskError::Validation(
                "Current password is incorrect".to_string(),
            ));
        }
        self.check_rate(&user.email)?;
        self.issue_change_code(&user).await
    }

    pub async fn resend_password_change_code(
        &self,
        username: &str,
    ) -> Result<CodeIssued, DeskError> {
        let Some(user) = self.store.find_user_by_username(username).await? else {
            return Err(DeskError::NotFound("User not found".to_string()));
        };
        self.check_rate(&user.email)?;
        self.issue_change_code(&user).await
    }

    pub async fn confirm_password_change(
        &self,
        username: &str,
        req: &PasswordChangeConfirmRequest,
    ) -> Result<(), DeskError> {
        let code = req.code.trim();
        if code.is_empty() {
            return Err(DeskError::Validation(
                "Verification code is required".to_string(),
            ));
        }
        if !codes::is_well_formed(code) {
            return Err(DeskError::Validation("Invalid code format".to_string()));
        }
        if req.new_password.is_empty() {
            return Err(DeskError::Validation("New password is required".to_string()));
        }
        check_password_length(&req.new_password, "Password")?;
        if req.new_password != req.confirm_password {
            return Err(DeskError::Validation("Passwords do not match".to_string()));
        }

        let otp = self
            .store
            .find_change_otp(username, code)
            .await?
            .ok_or(DeskError::CodeInvalid(CodeKind::PasswordChange))?;
        if otp.used {
            return Err(DeskError::CodeUsed(CodeKind::PasswordChange));
        }
        if otp.is_expired(Utc::now()) {
            return Err(DeskError::CodeExpired(CodeKind::PasswordChange));
        }

        let hash = self.hash_secret(&req.new_password).await?;
        if !self.store.update_password_by_username(username, &hash).await? {
            return Err(DeskError::NotFound("User not found".to_string()));
        }
        self.store.mark_change_otp_used(username, code).await?;
        info!(username, "password changed with e-mailed code");
        Ok(())
    }

    pub async fn profile(&self, username: &str) -> Result<UserDoc, DeskError> {
        self.store
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| DeskError::NotFound("User not found".to_string()))
    }

    /// Drops expired pending signups and idle rate-limit buckets.
    pub async fn purge_expired(&self) -> Result<u64, DeskError> {
        let removed = self.store.purge_expired_pending(Utc::now()).await?;
        self.limiter.retain_recent();
        if removed > 0 {
            info!(removed, "expired pending verifications purged");
        }
        Ok(removed)
    }

    async fn issue_reset(&self, user: &UserDoc) -> Result<CodeIssued, DeskError> {
        let code = codes::generate_code();
        let now = Utc::now();
        self.store
            .put_reset(PasswordReset {
                email: user.email.clone(),
                code: code.clone(),
                created_at: now,
                expires_at: expiry_after(now, self.settings.reset_expiry_secs),
                used: false,
            })
            .await?;

        let rendered = templates::password_reset(
            &user.username,
            &code,
            minutes(self.settings.reset_expiry_secs),
        );
        Ok(self.dispatch_code(&user.email, &code, rendered).await)
    }

    async fn issue_change_code(&self, user: &UserDoc) -> Result<CodeIssued, DeskError> {
        let code = codes::generate_code();
        let now = Utc::now();
        self.store
            .put_change_otp(PasswordChangeOtp {
                username: user.username.clone(),
                code: code.clone(),
                created_at: now,
                expires_at: expiry_after(now, self.settings.change_expiry_secs),
                used: false,
            })
            .await?;

        let rendered = templates::password_change(
            &user.username,
            &code,
            minutes(self.settings.change_expiry_secs),
        );
        Ok(self.dispatch_code(&user.email, &code, rendered).await)
    }

    async fn dispatch_verification(&self, email: &str, username: &str, code: &str) -> CodeIssued {
        let rendered = templates::verification(
            username,
            code,
            minutes(self.settings.verification_expiry_secs),
        );
        self.dispatch_code(email, code, rendered).await
    }

    /// Sends a code e-mail. When it does not reach the relay the code is
    /// handed back so the flow can continue.
    async fn dispatch_code(
        &self,
        email: &str,
        code: &str,
        rendered: templates::Rendered,
    ) -> CodeIssued {
        let mail = OutgoingMail {
            to: email.to_string(),
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
        };
        let fallback = match self.mailer.send(mail).await {
            Ok(delivery) if delivery.reached_inbox() => None,
            Ok(delivery) => {
                info!(%email, code, ?delivery, "one-time code not e-mailed");
                Some(code.to_string())
            }
            Err(e) => {
                warn!(%email, error = %e, "one-time code e-mail failed; returning code to client");
                Some(code.to_string())
            }
        };
        CodeIssued {
            email: email.to_string(),
            emailed: fallback.is_none(),
            dev_code: fallback,
        }
    }

    /// PBKDF2 and scrypt run on the blocking pool, off the request workers.
    async fn hash_secret(&self, password: &str) -> Result<String, DeskError> {
        let password = password.to_string();
        let iterations = self.settings.hash_iterations;
        tokio::task::spawn_blocking(move || hash_password(&password, iterations))
            .await
            .map_err(|e| DeskError::PasswordHash(e.to_string()))
    }

    async fn check_secret(&self, stored: &str, password: &str) -> Result<bool, DeskError> {
        let (stored, password) = (stored.to_string(), password.to_string());
        tokio::task::spawn_blocking(move || verify_password(&stored, &password))
            .await
            .map_err(|e| DeskError::PasswordHash(e.to_string()))
    }

    fn check_rate(&self, email: &str) -> Result<(), DeskError> {
        self.limiter.check_key(&email.to_string()).map_err(|_| {
            warn!(%email, "code e-mail rate limit hit");
            DeskError::RateLimited
        })
    }
}

fn normalize_email(email: &str) -> Result<String, DeskError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(DeskError::Validation(
            "Please enter your email address".to_string(),
        ));
    }
    if !is_valid_email(&email) {
        return Err(DeskError::Validation(
            "Please enter a valid email address".to_string(),
        ));
    }
    Ok(email)
}

fn check_password_length(password: &str, label: &str) -> Result<(), DeskError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(DeskError::Validation(format!(
            "{label} must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

fn codes_match(stored: &str, given: &str) -> bool {
    bool::from(stored.as_bytes().ct_eq(given.as_bytes()))
}

fn first_violation(errors: &ValidationErrors, order: &[&str]) -> DeskError {
    let fields = errors.field_errors();
    let message = order
        .iter()
        .filter_map(|field| fields.get(*field))
        .chain(fields.values())
        .flat_map(|errs| errs.iter())
        .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
        .unwrap_or_else(|| "Invalid input".to_string());
    DeskError::Validation(message)
}

/// `now` plus `secs`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn minutes(expiry_secs: u64) -> u64 {
    expiry_secs.div_ceil(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::mail::mailer::testing::RecordingTransport;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn settings() -> AccountSettings {
        AccountSettings {
            verification_expiry_secs: 600,
            reset_expiry_secs: 900,
            change_expiry_secs: 900,
            hash_iterations: 1_000,
            mail_rate_per_minute: 100,
        }
    }

    fn dev_service() -> (AccountService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        (
            AccountService::new(store.clone(), mailer, settings()),
            store,
        )
    }

    fn signup_req(username: &str, email: &str) -> SignupRequest {
        SignupRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: "secret1".to_string(),
            confirm_password: "secret1".to_string(),
        }
    }

    fn validation_message(err: DeskError) -> String {
        match err {
            DeskError::Validation(m) => m,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_admin_is_seeded_once_and_logs_in() {
        let (svc, store) = dev_service();
        assert!(svc.seed_default_admin().await.unwrap());
        assert!(!svc.seed_default_admin().await.unwrap());
        assert_eq!(store.user_count().await, 1);

        let admin = svc.login("admin", "admin123").await.unwrap();
        assert_eq!(admin.role, Role::Admin);
        let by_mail = svc.login("ADMIN@tradingbot.com", "admin123").await.unwrap();
        assert_eq!(by_mail.username, "admin");
        assert!(matches!(
            svc.login("admin", "wrong").await,
            Err(DeskError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn signup_verify_then_login() {
        let (svc, _store) = dev_service();
        let (issued, username) = svc
            .signup(signup_req("  alice ", "Alice@Example.com"))
            .await
            .unwrap();
        assert_eq!(username, "alice");
        assert_eq!(issued.email, "alice@example.com");
        assert!(!issued.emailed);
        let code = issued.dev_code.expect("dev mode hands back the code");

        let user = svc.verify_signup("alice@example.com", &code).await.unwrap();
        assert_eq!(user.role, Role::User);
        assert!(user.email_verified);

        svc.login("alice", "secret1").await.unwrap();
        assert!(matches!(
            svc.verify_signup("alice@example.com", &code).await,
            Err(DeskError::CodeInvalid(CodeKind::Verification))
        ));
    }

    #[tokio::test]
    async fn signup_rules_are_reported_in_field_order() {
        let (svc, _) = dev_service();
        let mut req = signup_req("al", "not-an-email");
        req.password = "123".to_string();
        let msg = validation_message(svc.signup(req).await.unwrap_err());
        assert!(msg.starts_with("Username"), "{msg}");

        let msg = validation_message(
            svc.signup(signup_req("bad name", "a@example.com"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "Username can only contain letters and numbers");

        let msg = validation_message(
            svc.signup(signup_req("alice", "nope")).await.unwrap_err(),
        );
        assert_eq!(msg, "Please enter a valid email address");

        let mut req = signup_req("alice", "a@example.com");
        req.confirm_password = "different".to_string();
        let msg = validation_message(svc.signup(req).await.unwrap_err());
        assert_eq!(msg, "Passwords do not match");

        let mut req = signup_req("alice", "a@example.com");
        req.password.clear();
        let msg = validation_message(svc.signup(req).await.unwrap_err());
        assert_eq!(msg, "Please fill in all fields");
    }

    #[tokio::test]
    async fn signup_rejects_taken_username_and_email() {
        let (svc, _) = dev_service();
        svc.seed_default_admin().await.unwrap();
        assert!(matches!(
            svc.signup(signup_req("admin", "new@example.com")).await,
            Err(DeskError::Conflict(_))
        ));
        assert!(matches!(
            svc.signup(signup_req("newbie", "admin@tradingbot.com")).await,
            Err(DeskError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn expired_signup_code_is_reported_as_expired() {
        let (svc, store) = dev_service();
        let now = Utc::now();
        store
            .put_pending(PendingVerification {
                username: "bob".to_string(),
                email: "bob@example.com".to_string(),
                password_hash: hash_password("secret1", 10),
                code: "111111".to_string(),
                created_at: now - TimeDelta::seconds(700),
                expires_at: now - TimeDelta::seconds(100),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.verify_signup("bob@example.com", "111111").await,
            Err(DeskError::CodeExpired(CodeKind::Verification))
        ));
        assert!(matches!(
            svc.verify_signup("bob@example.com", "222222").await,
            Err(DeskError::CodeInvalid(CodeKind::Verification))
        ));
        assert!(matches!(
            svc.verify_signup("bob@example.com", "12ab").await,
            Err(DeskError::Validation(_))
        ));

        let issued = svc.resend_signup_code("bob@example.com").await.unwrap();
        let fresh = issued.dev_code.unwrap();
        svc.verify_signup("bob@example.com", &fresh).await.unwrap();
    }

    #[tokio::test]
    async fn verification_loses_race_for_username() {
        let (svc, store) = dev_service();
        let (issued, _) = svc
            .signup(signup_req("carol", "carol@example.com"))
            .await
            .unwrap();
        store
            .insert_user(UserDoc {
                id: None,
                username: "carol".to_string(),
                email: "other@example.com".to_string(),
                password_hash: "x".to_string(),
                role: Role::User,
                created_at: Utc::now(),
                email_verified: true,
            })
            .await
            .unwrap();

        let err = svc
            .verify_signup("carol@example.com", &issued.dev_code.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Conflict(_)));
        assert!(store.find_pending("carol@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forgot_password_is_neutral_for_unknown_address() {
        let (svc, _) = dev_service();
        assert_eq!(svc.forgot_password("ghost@example.com").await.unwrap(), None);
        assert!(matches!(
            svc.forgot_password("   ").await,
            Err(DeskError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn reset_code_works_once() {
        let (svc, _) = dev_service();
        svc.seed_default_admin().await.unwrap();
        let issued = svc
            .forgot_password("Admin@TradingBot.com")
            .await
            .unwrap()
            .unwrap();
        let code = issued.dev_code.unwrap();
        let req = ResetPasswordRequest {
            code: code.clone(),
            new_password: "rotated1".to_string(),
            confirm_password: "rotated1".to_string(),
        };

        svc.reset_password("admin@tradingbot.com", &req).await.unwrap();
        svc.login("admin", "rotated1").await.unwrap();
        assert!(matches!(
            svc.login("admin", "admin123").await,
            Err(DeskError::InvalidCredentials)
        ));
        assert!(matches!(
            svc.reset_password("admin@tradingbot.com", &req).await,
            Err(DeskError::CodeUsed(CodeKind::Reset))
        ));
    }

    #[tokio::test]
    async fn expired_reset_code_is_rejected() {
        let (svc, store) = dev_service();
        svc.seed_default_admin().await.unwrap();
        store
            .put_reset(PasswordReset {
                email: "admin@tradingbot.com".to_string(),
                code: "654321".to_string(),
                created_at: Utc::now() - TimeDelta::seconds(1000),
                expires_at: Utc::now() - TimeDelta::seconds(1),
                used: false,
            })
            .await
            .unwrap();
        let req = ResetPasswordRequest {
            code: "654321".to_string(),
            new_password: "rotated1".to_string(),
            confirm_password: "rotated1".to_string(),
        };
        assert!(matches!(
            svc.reset_password("admin@tradingbot.com", &req).await,
            Err(DeskError::CodeExpired(CodeKind::Reset))
        ));
    }

    #[tokio::test]
    async fn change_password_rules() {
        let (svc, _) = dev_service();
        svc.seed_default_admin().await.unwrap();
        let req = |current: &str, new: &str, confirm: &str| ChangePasswordRequest {
            current_password: current.to_string(),
            new_password: new.to_string(),
            confirm_password: confirm.to_string(),
        };

        let msg = validation_message(
            svc.change_password("admin", &req("admin123", "abc", "abc"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "New password must be at least 6 characters");

        let msg = validation_message(
            svc.change_password("admin", &req("wrong", "newpass1", "newpass1"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "Current password is incorrect");

        let msg = validation_message(
            svc.change_password("admin", &req("admin123", "admin123", "admin123"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "New password must be different from current password");

        let msg = validation_message(
            svc.change_password("admin", &req("admin123", "newpass1", "newpass2"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "New passwords do not match");

        svc.change_password("admin", &req("admin123", "newpass1", "newpass1"))
            .await
            .unwrap();
        svc.login("admin", "newpass1").await.unwrap();
    }

    #[tokio::test]
    async fn code_mails_are_rate_limited_per_address() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        let svc = AccountService::new(
            store,
            mailer,
            AccountSettings {
                mail_rate_per_minute: 1,
                ..settings()
            },
        );
        svc.signup(signup_req("dave", "dave@example.com")).await.unwrap();
        assert!(matches!(
            svc.resend_signup_code("dave@example.com").await,
            Err(DeskError::RateLimited)
        ));
        svc.signup(signup_req("erin", "erin@example.com")).await.unwrap();
    }

    #[tokio::test]
    async fn relayed_code_is_not_handed_back() {
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Mailer::new(
            Some(transport.clone()),
            Some("bot@example.com"),
            Duration::from_secs(15),
            false,
        )
        .unwrap();
        let svc = AccountService::new(Arc::new(MemoryStore::new()), mailer, settings());

        let (issued, _) = svc
            .signup(signup_req("frank", "frank@example.com"))
            .await
            .unwrap();
        assert!(issued.emailed);
        assert_eq!(issued.dev_code, None);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn stalled_relay_falls_back_to_returning_the_code() {
        let transport = Arc::new(RecordingTransport::stalling());
        let mailer = Mailer::new(
            Some(transport.clone()),
            Some("bot@example.com"),
            Duration::from_millis(50),
            false,
        )
        .unwrap();
        let svc = AccountService::new(Arc::new(MemoryStore::new()), mailer, settings());

        let (issued, _) = svc
            .signup(signup_req("grace", "grace@example.com"))
            .await
            .unwrap();
        assert!(!issued.emailed);
        assert!(issued.dev_code.is_some());
    }

    #[tokio::test]
    async fn purge_removes_expired_pending() {
        let (svc, store) = dev_service();
        store
            .put_pending(PendingVerification {
                username: "old".to_string(),
                email: "old@example.com".to_string(),
                password_hash: "x".to_string(),
                code: "000000".to_string(),
                created_at: Utc::now() - TimeDelta::seconds(1200),
                expires_at: Utc::now() - TimeDelta::seconds(600),
            })
            .await
            .unwrap();
        assert_eq!(svc.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn forgot_password_throttles_known_and_unknown_addresses_alike() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        let svc = AccountService::new(
            store,
            mailer,
            AccountSettings {
                mail_rate_per_minute: 3,
                ..settings()
            },
        );
        svc.seed_default_admin().await.unwrap();

        for email in ["admin@tradingbot.com", "ghost@example.com"] {
            for _ in 0..3 {
                svc.forgot_password(email).await.unwrap();
            }
            assert!(
                matches!(svc.forgot_password(email).await, Err(DeskError::RateLimited)),
                "{email} was not throttled"
            );
        }
    }

    #[tokio::test]
    async fn resend_reset_code_counts_against_the_same_limit() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        let svc = AccountService::new(
            store,
            mailer,
            AccountSettings {
                mail_rate_per_minute: 2,
                ..settings()
            },
        );
        svc.seed_default_admin().await.unwrap();

        svc.forgot_password("admin@tradingbot.com").await.unwrap();
        let issued = svc.resend_reset_code("admin@tradingbot.com").await.unwrap();
        assert!(issued.dev_code.is_some());
        assert!(matches!(
            svc.resend_reset_code("admin@tradingbot.com").await,
            Err(DeskError::RateLimited)
        ));
        assert!(matches!(
            svc.resend_reset_code("ghost@example.com").await,
            Err(DeskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn huge_code_lifetimes_saturate_instead_of_overflowing() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        let svc = AccountService::new(
            store.clone(),
            mailer,
            AccountSettings {
                verification_expiry_secs: 100_000_000_000_000_000,
                reset_expiry_secs: u64::MAX,
                ..settings()
            },
        );

        let (issued, _) = svc
            .signup(signup_req("henry", "henry@example.com"))
            .await
            .unwrap();
        let pending = store.find_pending("henry@example.com").await.unwrap().unwrap();
        assert_eq!(pending.expires_at, DateTime::<Utc>::MAX_UTC);
        svc.verify_signup("henry@example.com", &issued.dev_code.unwrap())
            .await
            .unwrap();

        let issued = svc
            .forgot_password("henry@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(issued.dev_code.is_some());
    }

    #[test]
    fn expiry_is_added_to_now() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 600), now + TimeDelta::seconds(600));
        assert_eq!(expiry_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn password_hashing_leaves_the_runtime_responsive() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Mailer::new(None, None, Duration::from_secs(15), true).unwrap();
        let svc = AccountService::new(
            store,
            mailer,
            AccountSettings {
                hash_iterations: 50_000,
                ..settings()
            },
        );
        svc.seed_default_admin().await.unwrap();

        let ticked = Arc::new(AtomicBool::new(false));
        let flag = ticked.clone();
        let ticker = tokio::spawn(async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        });

        svc.login("admin", "admin123").await.unwrap();
        assert!(ticked.load(Ordering::SeqCst));
        ticker.await.unwrap();
    }

    fn change_req(code: &str, new: &str, confirm: &str) -> PasswordChangeConfirmRequest {
        PasswordChangeConfirmRequest {
            code: code.to_string(),
            new_password: new.to_string(),
            confirm_password: confirm.to_string(),
        }
    }

    #[tokio::test]
    async fn mailed_code_confirms_password_change_once() {
        let (svc, _) = dev_service();
        svc.seed_default_admin().await.unwrap();

        let msg = validation_message(
            svc.request_password_change("admin", "wrong")
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "Current password is incorrect");
        let msg = validation_message(svc.request_password_change("admin", "").await.unwrap_err());
        assert_eq!(msg, "Current password is required");

        let issued = svc
            .request_password_change("admin", "admin123")
            .await
            .unwrap();
        assert_eq!(issued.email, "admin@tradingbot.com");
        let code = issued.dev_code.unwrap();

        let msg = validation_message(
            svc.confirm_password_change("admin", &change_req(&code, "fresh12", "fresh13"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "Passwords do not match");
        let msg = validation_message(
            svc.confirm_password_change("admin", &change_req("12ab", "fresh12", "fresh12"))
                .await
                .unwrap_err(),
        );
        assert_eq!(msg, "Invalid code format");

        let wrong = if code == "000000" { "111111" } else { "000000" };
        assert!(matches!(
            svc.confirm_password_change("admin", &change_req(wrong, "fresh12", "fresh12"))
                .await,
            Err(DeskError::CodeInvalid(CodeKind::PasswordChange))
        ));

        let req = change_req(&code, "fresh12", "fresh12");
        svc.confirm_password_change("admin", &req).await.unwrap();
        svc.login("admin", "fresh12").await.unwrap();
        assert!(matches!(
            svc.confirm_password_change("admin", &req).await,
            Err(DeskError::CodeUsed(CodeKind::PasswordChange))
        ));
    }

    #[tokio::test]
    async fn resent_change_code_replaces_the_old_one() {
        let (svc, store) = dev_service();
        svc.seed_default_admin().await.unwrap();
        store
            .put_change_otp(PasswordChangeOtp {
                username: "admin".to_string(),
                code: "424242".to_string(),
                created_at: Utc::now() - TimeDelta::seconds(1000),
                expires_at: Utc::now() - TimeDelta::seconds(1),
                used: false,
            })
            .await
            .unwrap();
        assert!(matches!(
            svc.confirm_password_change("admin", &change_req("424242", "fresh12", "fresh12"))
                .await,
            Err(DeskError::CodeExpired(CodeKind::PasswordChange))
        ));

        let fresh = svc
            .resend_password_change_code("admin")
            .await
            .unwrap()
            .dev_code
            .unwrap();
        if fresh != "424242" {
            assert!(matches!(
                svc.confirm_password_change("admin", &change_req("424242", "fresh12", "fresh12"))
                    .await,
                Err(DeskError::CodeInvalid(CodeKind::PasswordChange))
            ));
        }
        svc.confirm_password_change("admin", &change_req(&fresh, "fresh12", "fresh12"))
            .await
            .unwrap();
        assert!(matches!(
            svc.resend_password_change_code("nobody").await,
            Err(DeskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn change_code_mail_goes_through_the_relay() {
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Mailer::new(
            Some(transport.clone()),
            Some("bot@example.com"),
            Duration::from_secs(15),
            false,
        )
        .unwrap();
        let svc = AccountService::new(Arc::new(MemoryStore::new()), mailer, settings());
        svc.seed_default_admin().await.unwrap();

        let issued = svc
            .request_password_change("admin", "admin123")
            .await
            .unwrap();
        assert!(issued.emailed);
        assert_eq!(issued.dev_code, None);
        assert_eq!(transport.calls(), 1);
    }
}
