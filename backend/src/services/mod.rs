// Outbound delivery services, one sender per channel

pub mod sender;
pub mod email;
pub mod whatsapp;

pub use sender::{NotificationSender, OutboundMessage, SendError, Senders, UnconfiguredSender};
pub use email::EmailSender;
pub use whatsapp::WhatsAppSender;
