use crate::db::models::{PasswordChangeOtp, PasswordReset, PendingVerification, UserDoc};
use crate::db::store::AccountStore;
use crate::error::DeskError;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use bson::{Document, doc};
use chrono::{DateTime, Utc};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
const DUPLICATE_KEY: i32 = 11000;

/// Two extra attempts, one second apart, for operations hit by a
/// dropped connection.
fn transient_policy() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_secs(1))
        .with_max_times(2)
}

/// Startup connectivity check: three attempts, two seconds apart.
fn startup_policy() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_secs(2))
        .with_max_times(2)
}

fn is_transient(e: &MongoError) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn is_duplicate_key(e: &MongoError) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY,
        _ => false,
    }
}

async fn retrying<T, F, Fut>(operation: &'static str, f: F) -> Result<T, MongoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MongoError>>,
{
    f.retry(transient_policy())
        .when(is_transient)
        .notify(|err: &MongoError, dur: Duration| {
            warn!(operation, error = %err, "MongoDB transient failure, retrying in {:?}", dur);
        })
        .await
}

fn bson_time(t: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(t)
}

/// [`AccountStore`] backed by MongoDB collections `users`,
/// `pending_verifications`, `password_resets` and `password_change_otps`.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    users: Collection<UserDoc>,
    pending: Collection<PendingVerification>,
    resets: Collection<PasswordReset>,
    change_otps: Collection<PasswordChangeOtp>,
}

impl MongoStore {
    /// Build the client. The driver connects lazily, so this only fails on a
    /// malformed URI.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, DeskError> {
        let mut opts = ClientOptions::parse(uri).await?;
        opts.app_name = Some("tradedesk".to_string());
        opts.connect_timeout = Some(CONNECT_TIMEOUT);
        opts.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        let client = Client::with_options(opts)?;
        let db = client.database(db_name);
        Ok(Self {
            users: db.collection("users"),
            pending: db.collection("pending_verifications"),
            resets: db.collection("password_resets"),
            change_otps: db.collection("password_change_otps"),
            db,
        })
    }

    /// Ping until the server answers or the startup attempts run out.
    pub async fn wait_until_ready(&self) -> Result<(), DeskError> {
        (|| async { self.db.run_command(doc! { "ping": 1 }).await })
            .retry(startup_policy())
            .notify(|err: &MongoError, dur: Duration| {
                warn!(error = %err, "MongoDB connection attempt failed, retrying in {:?}", dur);
            })
            .await?;
        info!(database = %self.db.name(), "connected to MongoDB");
        Ok(())
    }

    pub async fn ensure_indexes(&self) -> Result<(), DeskError> {
        let unique = || IndexOptions::builder().unique(true).build();
        self.users
            .create_indexes([
                IndexModel::builder()
                    .keys(doc! { "username": 1 })
                    .options(unique())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "email": 1 })
                    .options(unique())
                    .build(),
            ])
            .await?;
        self.pending
            .create_index(IndexModel::builder().keys(doc! { "email": 1 }).build())
            .await?;
        self.resets
            .create_index(IndexModel::builder().keys(doc! { "email": 1 }).build())
            .await?;
        self.change_otps
            .create_index(IndexModel::builder().keys(doc! { "username": 1 }).build())
            .await?;
        Ok(())
    }

    async fn set_password(&self, filter: Document, password_hash: &str) -> Result<bool, DeskError> {
        let update = doc! {
            "$set": {
                "password_hash": password_hash,
                "updated_at": bson_time(Utc::now()),
            }
        };
        let res = retrying("update_password", || {
            self.users.update_one(filter.clone(), update.clone()).into_future()
        })
        .await?;
        Ok(res.matched_count > 0)
    }
}

#[async_trait]
impl AccountStore for MongoStore {
    async fn ping(&self) -> Result<(), DeskError> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserDoc>, DeskError> {
        let found = retrying("find_user_by_username", || {
            self.users.find_one(doc! { "username": username }).into_future()
        })
        .await?;
        Ok(found)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserDoc>, DeskError> {
        let found = retrying("find_user_by_email", || {
            self.users.find_one(doc! { "email": email }).into_future()
        })
        .await?;
        Ok(found)
    }

    async fn insert_user(&self, mut user: UserDoc) -> Result<UserDoc, DeskError> {
        user.id = None;
        let res = match self.users.insert_one(&user).await {
            Ok(res) => res,
            Err(e) if is_duplicate_key(&e) => {
                return Err(DeskError::Conflict(
                    "Username or email already exists".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        user.id = res.inserted_id.as_object_id();
        Ok(user)
    }

    async fn update_password_by_username(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError> {
        self.set_password(doc! { "username": username }, password_hash)
            .await
    }

    async fn update_password_by_email(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<bool, DeskError> {
        self.set_password(doc! { "email": email }, password_hash)
            .await
    }

    async fn put_pending(&self, pending: PendingVerification) -> Result<(), DeskError> {
        let filter = doc! { "email": pending.email.as_str() };
        retrying("put_pending", || {
            self.pending
                .replace_one(filter.clone(), &pending)
                .upsert(true)
                .into_future()
        })
        .await?;
        Ok(())
    }

    async fn find_pending(&self, email: &str) -> Result<Option<PendingVerification>, DeskError> {
        let found = retrying("find_pending", || {
            self.pending.find_one(doc! { "email": email }).into_future()
        })
        .await?;
        Ok(found)
    }

    async fn update_pending_code(
        &self,
        email: &str,
        code: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DeskError> {
        let update = doc! {
            "$set": {
                "code": code,
                "created_at": bson_time(created_at),
                "expires_at": bson_time(expires_at),
            }
        };
        let res = retrying("update_pending_code", || {
            self.pending
                .update_one(doc! { "email": email }, update.clone())
                .into_future()
        })
        .await?;
        Ok(res.matched_count > 0)
    }

    async fn delete_pending(&self, email: &str) -> Result<(), DeskError> {
        retrying("delete_pending", || {
            self.pending.delete_many(doc! { "email": email }).into_future()
        })
        .await?;
        Ok(())
    }

    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, DeskError> {
        let res = self
            .pending
            .delete_many(doc! { "expires_at": { "$lt": bson_time(now) } })
            .await?;
        Ok(res.deleted_count)
    }

    async fn put_reset(&self, reset: PasswordReset) -> Result<(), DeskError> {
        let filter = doc! { "email": reset.email.as_str() };
        retrying("put_reset", || {
            self.resets
                .replace_one(filter.clone(), &reset)
                .upsert(true)
                .into_future()
        })
        .await?;
        Ok(())
    }

    async fn find_reset(
        &self,
        email: &str,
        code: &str,
    ) -> Result<Option<PasswordReset>, DeskError> {
        let found = retrying("find_reset", || {
            self.resets
                .find_one(doc! { "email": email, "code": code })
                .into_future()
        })
        .await?;
        Ok(found)
    }

    async fn mark_reset_used(&self, email: &str, code: &str) -> Result<(), DeskError> {
        retrying("mark_reset_used", || {
            self.resets
                .update_one(
                    doc! { "email": email, "code": code },
                    doc! { "$set": { "used": true } },
                )
                .into_future()
        })
        .await?;
        Ok(())
    }

    async fn put_change_otp(&self, otp: PasswordChangeOtp) -> Result<(), DeskError> {
        let filter = doc! { "username": otp.username.as_str() };
        retrying("put_change_otp", || {
            self.change_otps
                .replace_one(filter.clone(), &otp)
                .upsert(true)
                .into_future()
        })
        .await?;
        Ok(())
    }

    async fn find_change_otp(
        &self,
        username: &str,
        code: &str,
    ) -> Result<Option<PasswordChangeOtp>, DeskError> {
        let found = retrying("find_change_otp", || {
            self.change_otps
                .find_one(doc! { "username": username, "code": code })
                .into_future()
        })
        .await?;
        Ok(found)
    }

    async fn mark_change_otp_used(&self, username: &str, code: &str) -> Result<(), DeskError> {
        retrying("mark_change_otp_used", || {
            self.change_otps
                .update_one(
                    doc! { "username": username, "code": code },
                    doc! { "$set": { "used": true } },
                )
                .into_future()
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = MongoError::from(io);
        assert!(is_transient(&err));
        assert!(!is_duplicate_key(&err));
    }

    #[tokio::test]
    async fn malformed_uri_is_rejected_before_connecting() {
        let res = MongoStore::connect("not-a-mongo-uri", "tradingbot").await;
        assert!(matches!(res, Err(DeskError::Database(_))));
    }
}
