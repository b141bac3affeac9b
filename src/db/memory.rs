use crate::db::models::{PasswordChangeOtp, PasswordReset, PendingVerification, UserDoc};
use crate::db::store::AccountStore;
use crate::error::DeskError;
use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    users: Vec<UserDoc>,
    pending: HashMap<String, PendingVerification>,
    resets: HashMap<String, PasswordReset>,
    change_otps: HashMap<String, PasswordChangeOtp>,
}

/// Non-persistent [`AccountStore`] for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn ping(&self) -> Result<(), DeskError> {
        Ok(())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserDoc>, DeskError> {
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.username == username).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserDoc>, DeskError> {
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.email == email).cloned())
    }

    async fn insert_user(&self, mut user: UserDoc) -> Result<UserDoc, DeskError> {
        let mut tables = self.tables.write().await;
        if tables.users.iter().any(|u| u.username == user.username) {
            return Err(DeskError::Conflict("Username already exists".to_string()));
        }
        if tables.users.iter().any(|u| u.email == user.email) {
            return Err(DeskError::Conflict("Email already exists".to_string()));
        }
        user.id = Some(ObjectId::new());
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn update_password_by_username(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.iter_mut().find(|u| u.username == username) else {
            return Ok(false);
        };
        user.password_hash = password_hash.to_string();
        Ok(true)
    }

    async fn update_password_by_email(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.iter_mut().find(|u| u.email == email) else {
            return Ok(false);
        };
        user.password_hash = password_hash.to_string();
        Ok(true)
    }

    async fn put_pending(&self, pending: PendingVerification) -> Result<(), DeskError> {
        let mut tables = self.tables.write().await;
        tables.pending.insert(pending.email.clone(), pending);
        Ok(())
    }

    async fn find_pending(&self, email: &str) -> Result<Option<PendingVerification>, DeskError> {
        Ok(self.tables.read().await.pending.get(email).cloned())
    }

    async fn update_pending_code(
        &self,
        email: &str,
        code: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DeskError> {
        let mut tables = self.tables.write().await;
        let Some(pending) = tables.pending.get_mut(email) else {
            return Ok(false);
        };
        pending.code = code.to_string();
        pending.created_at = created_at;
        pending.expires_at = expires_at;
        Ok(true)
    }

    async fn delete_pending(&self, email: &str) -> Result<(), DeskError> {
        self.tables.write().await.pending.remove(email);
        Ok(())
    }

    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, DeskError> {
        let mut tables = self.tables.write().await;
        let before = tables.pending.len();
        tables.pending.retain(|_, p| p.expires_at >= now);
        Ok((before - tables.pending.len()) as u64)
    }

    async fn put_reset(&self, reset: PasswordReset) -> Result<(), DeskError> {
        let mut tables = self.tables.write().await;
        tables.resets.insert(reset.email.clone(), reset);
        Ok(())
    }

    async fn find_reset(
        &self,
        email: &str,
        code: &str,
    ) -> Result<Option<PasswordReset>, DeskError> {
        let tables = self.tables.read().await;
        Ok(tables
            .resets
            .get(email)
            .filter(|r| r.code == code)
            .cloned())
    }

    async fn mark_reset_used(&self, email: &str, code: &str) -> Result<(), DeskError> {
        let mut tables = self.tables.write().await;
        if let Some(reset) = tables.resets.get_mut(email)
            && reset.code == code
        {
            reset.used = true;
        }
        Ok(())
    }

    async fn put_change_otp(&self, otp: PasswordChangeOtp) -> Result<(), DeskError> {
        let mut tables = self.tables.write().await;
        tables.change_otps.insert(otp.username.clone(), otp);
        Ok(())
    }

    async fn find_change_otp(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Option<PasswordChangeOtp>, DeskError> {
        let tables = self.tables.read().await;
        Ok(tables
            .change_otps
            .get(username)
            .filter(|o| o.code == code)
            .cloned())
    }

    async fn mark_change_otp_used(&self, username: &str, code: &str) -> Result<(), DeskError> {
        let mut tables = self.tables.write().await;
        if let Some(otp) = tables.change_otps.get_mut(username)
            && otp.code == code
        {
            otp.used = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Role;
    use chrono::Duration;

    fn user(name: &str, email: &str) -> UserDoc {
        UserDoc {
            id: None,
            username: name.to_string(),
            email: email.to_string(),
            password_hash: "x".to_string(),
            role: Role::User,
            created_at: Utc::now(),
            email_verified: true,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_username_and_email() {
        let store = MemoryStore::new();
        let stored = store.insert_user(user("alice", "a@example.com")).await.unwrap();
        assert!(stored.id.is_some());

        let err = store
            .insert_user(user("alice", "other@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Conflict(_)));

        let err = store
            .insert_user(user("bob", "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Conflict(_)));
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn login_lookup_falls_back_to_lowercased_email() {
        let store = MemoryStore::new();
        store.insert_user(user("alice", "a@example.com")).await.unwrap();

        let by_name = store.find_user_by_login("alice").await.unwrap();
        assert_eq!(by_name.map(|u| u.username), Some("alice".to_string()));

        let by_mail = store.find_user_by_login("A@Example.com").await.unwrap();
        assert_eq!(by_mail.map(|u| u.username), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn purge_drops_only_expired_pending() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (email, offset) in [("old@example.com", -10), ("new@example.com", 600)] {
            store
                .put_pending(PendingVerification {
                    username: "u".to_string(),
                    email: email.to_string(),
                    password_hash: "x".to_string(),
                    code: "123456".to_string(),
                    created_at: now,
                    expires_at: now + Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.purge_expired_pending(now).await.unwrap(), 1);
        assert!(store.find_pending("old@example.com").await.unwrap().is_none());
        assert!(store.find_pending("new@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn new_change_code_replaces_the_previous_one() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for code in ["111111", "222222"] {
            store
                .put_change_otp(PasswordChangeOtp {
                    username: "alice".to_string(),
                    code: code.to_string(),
                    created_at: now,
                    expires_at: now + Duration::seconds(900),
                    used: false,
                })
                .await
                .unwrap();
        }

        assert!(store.find_change_otp("alice", "111111").await.unwrap().is_none());
        store.mark_change_otp_used("alice", "222222").await.unwrap();
        let otp = store.find_change_otp("alice", "222222").await.unwrap().unwrap();
        assert!(otp.used);
    }
}
