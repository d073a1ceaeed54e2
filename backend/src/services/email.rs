use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

use super::sender::{NotificationSender, OutboundMessage, SendError};

#[derive(Debug, Clone)]
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, SendError> {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        let from = format!("{} <{}>", smtp_config.from_name, smtp_config.from_email).parse::<Mailbox>()?;

        Ok(EmailSender { transport, from })
    }

    fn build(&self, recipient: &str, message: &OutboundMessage) -> Result<Message, SendError> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|_| SendError::InvalidRecipient(recipient.to_string()))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone().unwrap_or_default());

        let content_type = if message.body.trim_start().starts_with('<') {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };
        let built = builder.header(content_type).body(message.body.clone())?;

        Ok(built)
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<(), SendError> {
        let email = self.build(recipient, message)?;

        match self.transport.send(email).await {
            Ok(_) => {
                info!("Email sent successfully to {}", recipient);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", recipient, e);
                Err(e.into())
            }
        }
    }
}
