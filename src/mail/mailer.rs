use crate::config::Config;
use crate::error::DeskError;
use crate::mail::transport::{MailTransport, SmtpRelay};
use lettre::Message;
use lettre::message::{Mailbox, MultiPart};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// What happened to a message handed to [`Mailer::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the relay.
    Sent,
    /// Development mode: logged, no SMTP connection made.
    Suppressed,
    /// No credentials configured: logged, no SMTP connection made.
    Unconfigured,
}

impl Delivery {
    pub fn reached_inbox(self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

#[derive(Clone)]
pub struct Mailer {
    transport: Option<Arc<dyn MailTransport>>,
    from: Option<Mailbox>,
    timeout: Duration,
    dev_mode: bool,
}

impl Mailer {
    pub fn new(
        transport: Option<Arc<dyn MailTransport>>,
        from: Option<&str>,
        timeout: Duration,
        dev_mode: bool,
    ) -> Result<Self, DeskError> {
        let from = from
            .map(|f| {
                f.parse::<Mailbox>()
                    .map_err(|e| DeskError::MailAddress(format!("{f}: {e}")))
            })
            .transpose()?;
        Ok(Self {
            transport,
            from,
            timeout,
            dev_mode,
        })
    }

    /// Development mode never builds a relay; neither does a configuration
    /// without SMTP credentials.
    pub fn from_config(cfg: &Config) -> Result<Self, DeskError> {
        let sender = cfg.mail_sender();
        let transport: Option<Arc<dyn MailTransport>> = match cfg.mail_credentials() {
            Some((user, pass)) if !cfg.email_dev_mode => {
                Some(Arc::new(SmtpRelay::from_config(cfg, user, pass)?))
            }
            _ => None,
        };
        if cfg.email_dev_mode {
            info!("EMAIL_DEV_MODE enabled; codes are logged instead of e-mailed");
        } else if transport.is_none() {
            warn!("MAIL_USERNAME/MAIL_PASSWORD not set; codes are logged instead of e-mailed");
        } else {
            info!(
                server = %cfg.mail_server,
                port = cfg.mail_port,
                "e-mail configured"
            );
        }
        Self::new(
            transport,
            sender.as_deref(),
            cfg.mail_timeout(),
            cfg.email_dev_mode,
        )
    }

    /// Delivers `mail`, abandoning the SMTP exchange once the mail timeout
    /// elapses.
    pub async fn send(&self, mail: OutgoingMail) -> Result<Delivery, DeskError> {
        if self.dev_mode {
            info!(to = %mail.to, subject = %mail.subject, "[dev mode] mail suppressed");
            return Ok(Delivery::Suppressed);
        }
        let (Some(transport), Some(from)) = (self.transport.as_ref(), self.from.as_ref()) else {
            warn!(to = %mail.to, subject = %mail.subject, "mail not configured; message not sent");
            return Ok(Delivery::Unconfigured);
        };

        let to = mail
            .to
            .parse::<Mailbox>()
            .map_err(|e| DeskError::MailAddress(format!("{}: {e}", mail.to)))?;
        let message = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .multipart(MultiPart::alternative_plain_html(mail.text, mail.html))
            .map_err(|e| DeskError::MailDelivery(e.to_string()))?;

        match tokio::time::timeout(self.timeout, transport.deliver(message)).await {
            Ok(Ok(())) => {
                info!(to = %mail.to, subject = %mail.subject, "mail sent");
                Ok(Delivery::Sent)
            }
            Ok(Err(e)) => {
                error!(to = %mail.to, error = %e, "mail delivery failed");
                Err(e)
            }
            Err(_) => {
                error!(
                    to = %mail.to,
                    timeout_secs = self.timeout.as_secs(),
                    "mail delivery timed out; SMTP exchange abandoned"
                );
                Err(DeskError::MailTimeout(self.timeout.as_secs()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every message; optionally stalls forever.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: AtomicUsize,
        pub subjects: Mutex<Vec<String>>,
        pub stall: bool,
    }

    impl RecordingTransport {
        pub fn stalling() -> Self {
            Self {
                stall: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn deliver(&self, message: Message) -> Result<(), DeskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let raw = String::from_utf8_lossy(&message.formatted()).to_string();
            if let Some(line) = raw.lines().find(|l| l.starts_with("Subject:")) {
                self.subjects
                    .lock()
                    .unwrap()
                    .push(line.trim_start_matches("Subject:").trim().to_string());
            }
            if self.stall {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }
}
