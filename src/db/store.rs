use crate::db::models::{PasswordChangeOtp, PasswordReset, PendingVerification, UserDoc};
use crate::error::DeskError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence for accounts and their one-time codes.
///
/// Implementations must keep `username` and `email` unique across users and
/// report a collision from [`AccountStore::insert_user`] as
/// [`DeskError::Conflict`].
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn ping(&self) -> Result<(), DeskError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserDoc>, DeskError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserDoc>, DeskError>;

    /// Username match first, then the lower-cased e-mail.
    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserDoc>, DeskError> {
        if let Some(user) = self.find_user_by_username(login).await? {
            return Ok(Some(user));
        }
        self.find_user_by_email(&login.to_lowercase()).await
    }

    /// Returns the stored user with its id assigned.
    async fn insert_user(&self, user: UserDoc) -> Result<UserDoc, DeskError>;

    /// Returns false when no user matched.
    async fn update_password_by_username(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError>;

    async fn update_password_by_email(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError>;

    /// Replaces any pending verification for the same e-mail.
    async fn put_pending(&self, pending: PendingVerification) -> Result<(), DeskError>;

    async fn find_pending(&self, email: &str) -> Result<Option<PendingVerification>, DeskError>;

    /// Returns false when nothing is pending for `email`.
    async fn update_pending_code(
        &self,
        email: &str,
        code: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DeskError>;

    async fn delete_pending(&self, email: &str) -> Result<(), DeskError>;

    /// Drops pending verifications that expired before `now`.
    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, DeskError>;

    /// Replaces any reset record for the same e-mail.
    async fn put_reset(&self, reset: PasswordReset) -> Result<(), DeskError>;

    async fn find_reset(&self, email: &str, code: &str)
    -> Result<Option<PasswordReset>, DeskError>;

    async fn mark_reset_used(&self, email: &str, code: &str) -> Result<(), DeskError>;

    /// Replaces any password-change code for the same username.
    async fn put_change_otp(&self, otp: PasswordChangeOtp) -> Result<(), DeskError>;

    async fn find_change_otp(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Option<PasswordChangeOtp>, DeskError>;

    async fn mark_change_otp_used(&self, username: &str, code: &str) -> Result<(), DeskError>;
}
