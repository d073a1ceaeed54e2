use async_trait::async_trait;
use leadline_shared::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Invalid recipient '{0}'")]
    InvalidRecipient(String),
    #[error("Message could not be built: {0}")]
    Message(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Provider rejected message: status {status}, body: {body}")]
    Rejected { status: u16, body: String },
    #[error("No sender configured for channel {0}")]
    NotConfigured(Channel),
}

impl From<lettre::address::AddressError> for SendError {
    fn from(err: lettre::address::AddressError) -> Self {
        SendError::InvalidRecipient(err.to_string())
    }
}

impl From<lettre::error::Error> for SendError {
    fn from(err: lettre::error::Error) -> Self {
        SendError::Message(err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for SendError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        SendError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        SendError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Delivers one message to one recipient. Implementations never retry.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Stands in for a channel whose credentials are missing, so rows for it
/// fail with a clear error instead of being dropped.
pub struct UnconfiguredSender {
    channel: Channel,
}

impl UnconfiguredSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationSender for UnconfiguredSender {
    async fn send(&self, _recipient: &str, _message: &OutboundMessage) -> Result<(), SendError> {
        Err(SendError::NotConfigured(self.channel))
    }
}

/// Sender registry keyed by channel, fixed at composition time.
#[derive(Clone, Default)]
pub struct Senders {
    by_channel: HashMap<Channel, Arc<dyn NotificationSender>>,
}

impl Senders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Channel, sender: Arc<dyn NotificationSender>) -> Self {
        self.by_channel.insert(channel, sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Result<Arc<dyn NotificationSender>, SendError> {
        self.by_channel
            .get(&channel)
            .cloned()
            .ok_or(SendError::NotConfigured(channel))
    }
}
