pub mod mailer;
pub mod templates;
pub mod transport;

pub use mailer::{Delivery, Mailer, OutgoingMail};
pub use transport::{MailTransport, SmtpRelay, SmtpSecurity};
