use std::time::Duration;

use async_trait::async_trait;
use ka_core::config::AlertConfig;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::alert::{AlertError, AlertTransport};

/// Port on which SMTP servers expect TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;
const SMTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends alerts as plain-text mail through an SMTP relay.
#[derive(Clone)]
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("from", &self.from.to_string())
            .field("to", &self.to.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Build a transport from the alert config.
    ///
    /// Returns `Ok(None)` when no recipient is configured. The relay is not
    /// contacted until the first send.
    pub fn from_config(config: &AlertConfig) -> Result<Option<Self>, AlertError> {
        let Some(recipient) = config.recipient.as_deref() else {
            return Ok(None);
        };
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| AlertError::Setup("SMTP_HOST is required for mail alerts".into()))?;

        let to: Mailbox = recipient
            .parse()
            .map_err(|e| AlertError::Setup(format!("invalid ALERT_EMAIL {recipient:?}: {e}")))?;
        let sender = config
            .sender
            .as_deref()
            .or(config.smtp_user.as_deref())
            .unwrap_or(recipient);
        let from: Mailbox = sender
            .parse()
            .map_err(|e| AlertError::Setup(format!("invalid ALERT_FROM {sender:?}: {e}")))?;

        let builder = if config.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .map_err(|e| AlertError::Setup(format!("smtp relay {host}: {e}")))?;

        let mut builder = builder.port(config.smtp_port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(password)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        debug!(host, port = config.smtp_port, "smtp alert transport configured");
        Ok(Some(Self {
            mailer: builder.build(),
            from,
            to,
        }))
    }

    pub fn recipient(&self) -> String {
        self.to.to_string()
    }
}

#[async_trait]
impl AlertTransport for SmtpTransport {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| AlertError::Setup(e.to_string()))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
