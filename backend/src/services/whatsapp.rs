// WhatsApp chat delivery through the provider's HTTP messages API

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use super::sender::{NotificationSender, OutboundMessage, SendError};

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
    text: TextBody<'a>,
}

pub struct WhatsAppSender {
    client: reqwest::Client,
    api_url: String,
    api_token: String,
}

impl WhatsAppSender {
    pub fn new(api_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_token: api_token.into(),
        })
    }
}

#[async_trait]
impl NotificationSender for WhatsAppSender {
    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<(), SendError> {
        let to = recipient.trim_start_matches('+');
        if to.is_empty() || !to.chars().all(|c| c.is_ascii_digit()) {
            return Err(SendError::InvalidRecipient(recipient.to_string()));
        }

        let request = MessageRequest {
            messaging_product: "whatsapp",
            to,
            message_type: "text",
            text: TextBody { body: &message.body },
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await?;

        if response.status().is_success() {
            info!("WhatsApp message sent to {}", recipient);
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("WhatsApp provider rejected message to {}: {}", recipient, status);
            Err(SendError::Rejected { status, body })
        }
    }
}
