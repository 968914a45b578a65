//! Tamper Notifications
//!
//! Emails every approved voter of a running election when a detector fires, through a
//! primary mail API with a direct SMTP fallback.

pub mod notifier;
pub mod transport;

pub use notifier::{Notifier, NotifyOutcome, ALERT_SUBJECT};
pub use transport::{AlertMail, HttpMailTransport, MailTransport, SmtpMailTransport};
