use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{required, EmailConfig};
use crate::error::{ConfigError, NotifyError};
use crate::notify::{Notification, NotificationChannel};

// Fallback bound on a single SMTP conversation, the notifier timeout usually fires first.
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers notifications as email through an SMTP relay, using STARTTLS and login
/// credentials. The notification text is the subject.
pub struct EmailChannel {
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    /// Returns `Ok(None)` when no email setting is present at all.
    pub fn from_config(config: &EmailConfig) -> Result<Option<Self>, ConfigError> {
        if config.is_unset() {
            return Ok(None);
        }

        let from = parse_mailbox(required(&config.email_from, "EMAIL_FROM")?, "EMAIL_FROM")?;
        let to = required(&config.email_to, "EMAIL_TO")?
            .split(',')
            .map(|address| parse_mailbox(address, "EMAIL_TO"))
            .collect::<Result<Vec<_>, _>>()?;
        let host = required(&config.email_smtp_host, "EMAIL_SMTP_HOST")?;
        let port = config.smtp_port()?;
        let user = required(&config.email_user, "EMAIL_USER")?;
        let password = required(&config.email_password, "EMAIL_PASSWORD")?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| ConfigError::Invalid {
                key: "EMAIL_SMTP_HOST",
                reason: e.to_string(),
            })?
            .port(port)
            .credentials(Credentials::new(user.to_owned(), password.to_owned()))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        Ok(Some(Self {
            from,
            to,
            transport,
        }))
    }

    fn render(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let now = OffsetDateTime::now_utc();
        let timestamp = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.message());
        for mailbox in &self.to {
            builder = builder.to(mailbox.clone());
        }

        builder
            .body(format!("stethoscope message at {timestamp}."))
            .map_err(|e| NotifyError::Message(e.to_string()))
    }
}

fn parse_mailbox(address: &str, key: &'static str) -> Result<Mailbox, ConfigError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.render(notification)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
