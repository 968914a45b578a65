//! Mail Transports

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::error::MonitorError;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// One alert message addressed to every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    #[serde(rename = "text")]
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, mail: &AlertMail) -> Result<(), MonitorError>;
}

/// Primary transport: JSON POST to an HTTP mail API.
pub struct HttpMailTransport {
    api_url: Option<String>,
    api_token: Option<String>,
    http_client: Client,
}

impl HttpMailTransport {
    pub fn new(api_url: Option<String>, api_token: Option<String>) -> Self {
        let http_client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_url,
            api_token,
            http_client,
        }
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    fn name(&self) -> &'static str {
        "mail-api"
    }

    async fn send(&self, mail: &AlertMail) -> Result<(), MonitorError> {
        let url = self.api_url.as_deref().ok_or_else(|| {
            MonitorError::ConfigError("mail.api_url is not configured".to_string())
        })?;

        let mut request = self.http_client.post(url).json(mail);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MonitorError::NotificationError(format!("Mail API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::NotificationError(format!(
                "Mail API returned {}",
                status
            )));
        }

        debug!("Mail API accepted alert for {} recipients", mail.to.len());
        Ok(())
    }
}

/// Fallback transport: direct SMTP submission with login.
pub struct SmtpMailTransport {
    config: SmtpConfig,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn credentials(&self) -> Result<Credentials, MonitorError> {
        match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Ok(Credentials::new(user.clone(), pass.clone()))
            }
            _ => Err(MonitorError::MissingCredentials(
                "mail.smtp.username and mail.smtp.password must both be set".to_string(),
            )),
        }
    }

    fn build_message(mail: &AlertMail) -> Result<Message, MonitorError> {
        let parse = |addr: &str| {
            addr.parse::<Mailbox>().map_err(|e| {
                MonitorError::NotificationError(format!("Invalid address {}: {}", addr, e))
            })
        };

        let sender = parse(&mail.from)?;
        let mut builder = Message::builder()
            .from(sender.clone())
            .to(sender)
            .subject(mail.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        let mut accepted = 0;
        for recipient in &mail.to {
            match parse(recipient) {
                Ok(mailbox) => {
                    builder = builder.bcc(mailbox);
                    accepted += 1;
                }
                Err(e) => warn!("Skipping recipient: {}", e),
            }
        }
        if accepted == 0 {
            return Err(MonitorError::NotificationError(
                "No valid recipient address".to_string(),
            ));
        }

        builder
            .body(mail.body.clone())
            .map_err(|e| MonitorError::NotificationError(format!("Failed to build message: {}", e)))
    }

    fn build_transport(&self, credentials: Credentials) -> Result<AsyncSmtpTransport<Tokio1Executor>, MonitorError> {
        let builder = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host).map_err(|e| {
                MonitorError::NotificationError(format!("Invalid SMTP relay {}: {}", self.config.host, e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        };

        Ok(builder
            .port(self.config.port)
            .credentials(credentials)
            .timeout(Some(SEND_TIMEOUT))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, mail: &AlertMail) -> Result<(), MonitorError> {
        let credentials = self.credentials()?;
        let message = Self::build_message(mail)?;
        let transport = self.build_transport(credentials)?;

        transport
            .send(message)
            .await
            .map_err(|e| MonitorError::NotificationError(format!("SMTP delivery failed: {}", e)))?;

        info!(
            "Alert delivered over SMTP via {}:{} to {} recipients",
            self.config.host,
            self.config.port,
            mail.to.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mail() -> AlertMail {
        AlertMail {
            from: "security@example.org".to_string(),
            to: vec!["a@example.org".to_string(), "b@example.org".to_string()],
            subject: "Tampering Alert".to_string(),
            body: "DELETE on votes".to_string(),
        }
    }

    #[tokio::test]
    async fn test_http_transport_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "from": "security@example.org",
                "to": ["a@example.org", "b@example.org"],
                "text": "DELETE on votes"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpMailTransport::new(
            Some(format!("{}/send", server.uri())),
            Some("secret".to_string()),
        );
        transport.send(&mail()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_transport_reports_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = HttpMailTransport::new(Some(server.uri()), None);
        let result = transport.send(&mail()).await;
        assert!(matches!(result, Err(MonitorError::NotificationError(_))));
    }

    #[tokio::test]
    async fn test_http_transport_unconfigured() {
        let transport = HttpMailTransport::new(None, None);
        let result = transport.send(&mail()).await;
        assert!(matches!(result, Err(MonitorError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_smtp_requires_credentials() {
        let transport = SmtpMailTransport::new(SmtpConfig {
            username: Some("monitor@example.org".to_string()),
            password: None,
            ..SmtpConfig::default()
        });
        let result = transport.send(&mail()).await;
        assert!(matches!(result, Err(MonitorError::MissingCredentials(_))));
    }

    #[test]
    fn test_smtp_message_hides_recipients() {
        let message = SmtpMailTransport::build_message(&mail()).unwrap();
        let envelope = message.envelope();
        assert_eq!(envelope.to().len(), 3);
        let headers = String::from_utf8(message.formatted()).unwrap();
        assert!(headers.contains("Subject: Tampering Alert"));
        assert!(!headers.contains("a@example.org"));
    }

    #[test]
    fn test_smtp_skips_bad_recipient() {
        let mut bad = mail();
        bad.to.insert(1, "not an address".to_string());
        let message = SmtpMailTransport::build_message(&bad).unwrap();
        assert_eq!(message.envelope().to().len(), 3);
    }

    #[test]
    fn test_smtp_rejects_bad_sender_or_no_recipients() {
        let mut bad_sender = mail();
        bad_sender.from = "monitor at example".to_string();
        assert!(SmtpMailTransport::build_message(&bad_sender).is_err());

        let mut nobody = mail();
        nobody.to = vec!["not an address".to_string()];
        assert!(SmtpMailTransport::build_message(&nobody).is_err());
    }
}
