//! Alert fan-out to the voters of running elections.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::MailConfig;
use crate::database::Database;
use crate::error::MonitorError;
use crate::notify::transport::{AlertMail, HttpMailTransport, MailTransport, SmtpMailTransport};

pub const ALERT_SUBJECT: &str = "⚠️ Tampering Alert in Voting System";

/// Result of one notification attempt. Never an error: detectors record the alert first
/// and only log how delivery went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    NoRecipients,
    Delivered { via: String, recipients: usize },
    Failed(String),
}

pub struct Notifier {
    database: Database,
    primary: Arc<dyn MailTransport>,
    fallback: Arc<dyn MailTransport>,
    sender: Option<String>,
}

impl Notifier {
    pub fn new(
        database: Database,
        primary: Arc<dyn MailTransport>,
        fallback: Arc<dyn MailTransport>,
        sender: Option<String>,
    ) -> Self {
        Self {
            database,
            primary,
            fallback,
            sender,
        }
    }

    /// Mail API first, direct SMTP second.
    pub fn from_config(database: Database, config: &MailConfig) -> Self {
        Self::new(
            database,
            Arc::new(HttpMailTransport::new(
                config.api_url.clone(),
                config.api_token.clone(),
            )),
            Arc::new(SmtpMailTransport::new(config.smtp.clone())),
            config.sender(),
        )
    }

    /// Distinct emails of approved voters across all running elections.
    pub async fn recipients(&self) -> Result<Vec<String>, MonitorError> {
        self.database.running_voter_emails().await
    }

    pub fn compose(&self, from: &str, recipients: Vec<String>, reason: &str) -> AlertMail {
        AlertMail {
            from: from.to_string(),
            to: recipients,
            subject: ALERT_SUBJECT.to_string(),
            body: format!(
                "Dear voter,\n\n\
                 A possible vote tampering has been detected in a running election.\n\n\
                 Details: {}\n\n\
                 Please contact the administrator immediately.\n\n\
                 Online Voting System Security",
                reason
            ),
        }
    }

    pub async fn notify(&self, reason: &str) -> NotifyOutcome {
        let recipients = match self.recipients().await {
            Ok(recipients) => recipients,
            Err(e) => {
                error!("Failed to resolve alert recipients: {}", e);
                return NotifyOutcome::Failed(e.to_string());
            }
        };

        if recipients.is_empty() {
            info!("No running-election voters to notify");
            return NotifyOutcome::NoRecipients;
        }

        let Some(sender) = self.sender.as_deref() else {
            let reason = "no sender address configured (mail.from_address or mail.smtp.username)";
            error!("Cannot send tamper alert: {}", reason);
            return NotifyOutcome::Failed(reason.to_string());
        };

        let mail = self.compose(sender, recipients, reason);
        let count = mail.to.len();

        match self.primary.send(&mail).await {
            Ok(()) => {
                info!("✅ Tamper alert sent to {} voters via {}", count, self.primary.name());
                return NotifyOutcome::Delivered {
                    via: self.primary.name().to_string(),
                    recipients: count,
                };
            }
            Err(e) => warn!(
                "{} delivery failed, falling back to {}: {}",
                self.primary.name(),
                self.fallback.name(),
                e
            ),
        }

        match self.fallback.send(&mail).await {
            Ok(()) => {
                info!("✅ Tamper alert sent to {} voters via {}", count, self.fallback.name());
                NotifyOutcome::Delivered {
                    via: self.fallback.name().to_string(),
                    recipients: count,
                }
            }
            Err(e) => {
                error!("❌ {} delivery failed: {}", self.fallback.name(), e);
                NotifyOutcome::Failed(e.to_string())
            }
        }
    }
}
