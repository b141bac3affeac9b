use crate::config::Config;
use crate::error::DeskError;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::debug;

/// Hands a finished message to an outbound relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), DeskError>;
}

/// How the SMTP session is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte (`MAIL_USE_SSL`).
    Implicit,
    /// Plain connect upgraded with STARTTLS (`MAIL_USE_TLS`).
    StartTls,
    Plain,
}

impl SmtpSecurity {
    /// `MAIL_USE_SSL` takes precedence over `MAIL_USE_TLS`.
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.mail_use_ssl {
            SmtpSecurity::Implicit
        } else if cfg.mail_use_tls {
            SmtpSecurity::StartTls
        } else {
            SmtpSecurity::Plain
        }
    }
}

pub struct SmtpRelay {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn from_config(
        cfg: &Config,
        username: String,
        password: String,
    ) -> Result<Self, DeskError> {
        let host = cfg.mail_server.as_str();
        let security = SmtpSecurity::from_config(cfg);
        let builder = match security {
            SmtpSecurity::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| DeskError::MailDelivery(e.to_string()))?,
            SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| DeskError::MailDelivery(e.to_string()))?,
            SmtpSecurity::Plain => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };
        let inner = builder
            .port(cfg.mail_port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(socket_timeout(cfg.mail_timeout())))
            .build();
        debug!(host, port = cfg.mail_port, ?security, "SMTP relay configured");
        Ok(Self { inner })
    }
}

/// Per-socket-operation timeout; the whole transaction is bounded separately
/// by the mailer.
fn socket_timeout(total: Duration) -> Duration {
    total.min(Duration::from_secs(10))
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn deliver(&self, message: Message) -> Result<(), DeskError> {
        let response = self
            .inner
            .send(message)
            .await
            .map_err(|e| DeskError::MailDelivery(e.to_string()))?;
        debug!(code = %response.code(), "SMTP relay accepted message");
        Ok(())
    }
}
