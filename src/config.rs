use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::DeskError;

pub const DEFAULT_SECRET_KEY: &str = "supersecretkey123";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@tradingbot.com";

/// Environment variables read verbatim. Figment's env provider would turn
/// an all-digit value such as `MAIL_PASSWORD=12345678` into a number.
const TEXT_KEYS: &[&str] = &[
    "MONGODB_URI",
    "DB_NAME",
    "SECRET_KEY",
    "MAIL_SERVER",
    "MAIL_USERNAME",
    "MAIL_PASSWORD",
    "MAIL_DEFAULT_SENDER",
    "HOST",
    "LOGLEVEL",
];

/// Numeric and boolean variables, parsed by figment. Anything outside these
/// two lists is ignored.
const TYPED_KEYS: &[&str] = &[
    "MAIL_PORT",
    "MAIL_USE_TLS",
    "MAIL_USE_SSL",
    "MAIL_TIMEOUT",
    "MAIL_RATE_PER_MINUTE",
    "VERIFICATION_CODE_EXPIRY",
    "RESET_CODE_EXPIRY",
    "PASSWORD_CHANGE_CODE_EXPIRY",
    "EMAIL_DEV_MODE",
    "PORT",
    "WORKER_TIMEOUT",
    "GRACEFUL_TIMEOUT",
    "INSECURE_COOKIE",
    "PASSWORD_HASH_ITERATIONS",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub mongodb_uri: String,
    pub db_name: String,
    pub secret_key: String,

    pub mail_server: String,
    pub mail_port: u16,
    #[serde(deserialize_with = "flexible_bool")]
    pub mail_use_tls: bool,
    #[serde(deserialize_with = "flexible_bool")]
    pub mail_use_ssl: bool,
    pub mail_username: Option<String>,
    pub mail_password: Option<String>,
    pub mail_default_sender: Option<String>,
    /// Seconds before an SMTP transaction is abandoned.
    pub mail_timeout: u64,
    pub mail_rate_per_minute: u32,
    #[serde(deserialize_with = "flexible_bool")]
    pub email_dev_mode: bool,

    /// Seconds a signup verification code stays valid.
    pub verification_code_expiry: u64,
    /// Seconds a password reset code stays valid.
    pub reset_code_expiry: u64,
    /// Seconds a password change confirmation code stays valid.
    pub password_change_code_expiry: u64,
    pub password_hash_iterations: u32,

    pub host: String,
    pub port: u16,
    /// Per-request timeout in seconds.
    pub worker_timeout: u64,
    pub graceful_timeout: u64,
    pub loglevel: String,
    #[serde(deserialize_with = "flexible_bool")]
    pub insecure_cookie: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongodb_uri: "mongodb://localhost:27017/".to_string(),
            db_name: "tradingbot".to_string(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            mail_server: "smtp.gmail.com".to_string(),
            mail_port: 587,
            mail_use_tls: true,
            mail_use_ssl: false,
            mail_username: None,
            mail_password: None,
            mail_default_sender: None,
            mail_timeout: 15,
            mail_rate_per_minute: 3,
            email_dev_mode: false,
            verification_code_expiry: 600,
            reset_code_expiry: 900,
            password_change_code_expiry: 900,
            password_hash_iterations: 600_000,
            host: "0.0.0.0".to_string(),
            port: 10000,
            worker_timeout: 120,
            graceful_timeout: 30,
            loglevel: "info".to_string(),
            insecure_cookie: false,
        }
    }
}

impl Config {
    /// Defaults overlaid with the recognised environment variables.
    pub fn figment() -> Figment {
        let typed = Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::raw().only(TYPED_KEYS));
        TEXT_KEYS
            .iter()
            .fold(typed, |figment, key| match std::env::var(key) {
                Ok(value) => figment.merge(Serialized::default(&key.to_ascii_lowercase(), value)),
                Err(_) => figment,
            })
    }

    pub fn load() -> Result<Self, DeskError> {
        Ok(Self::figment().extract()?)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    /// SMTP credentials, present only when both halves are non-empty.
    pub fn mail_credentials(&self) -> Option<(String, String)> {
        let user = self.mail_username.as_deref().filter(|s| !s.trim().is_empty())?;
        let pass = self.mail_password.as_deref().filter(|s| !s.is_empty())?;
        Some((user.to_string(), pass.to_string()))
    }

    /// The From address: `MAIL_DEFAULT_SENDER`, else `MAIL_USERNAME`.
    pub fn mail_sender(&self) -> Option<String> {
        self.mail_default_sender
            .as_deref()
            .or(self.mail_username.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn mail_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_timeout)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }
}

/// Accepts native booleans as well as `"True"`, `"false"`, `"1"`, `"0"`.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolLike {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(b) => Ok(b),
        BoolLike::Int(i) => Ok(i != 0),
        BoolLike::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, found `{other}`"
            ))),
        },
    }
}
