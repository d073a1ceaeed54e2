// In-process event bus and the domain events the notification engine consumes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use leadline_shared::WorkflowTrigger;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EventError {
    /// The event cannot be handled no matter how often it is retried.
    #[error("Invalid event: {0}")]
    Invalid(String),
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl EventError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizationContext {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub quote_valid_days: Option<i32>,
    pub quote_payment_days: Option<i32>,
}

/// Lead-side facts shared by every lead-scoped domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadContext {
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub lead: Contact,
    pub lead_source: Option<String>,
    pub lead_service_type: Option<String>,
    pub pipeline_stage: Option<String>,
    pub partner: Option<Contact>,
    pub organization: OrganizationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteContext {
    pub quote_id: Uuid,
    pub quote_number: String,
    pub total: Option<Decimal>,
    pub public_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentContext {
    pub appointment_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    QuoteSent {
        context: LeadContext,
        quote: QuoteContext,
    },
    QuoteAccepted {
        context: LeadContext,
        quote: QuoteContext,
    },
    QuoteRejected {
        context: LeadContext,
        quote: QuoteContext,
    },
    AppointmentScheduled {
        context: LeadContext,
        appointment: AppointmentContext,
    },
    AppointmentReminderDue {
        context: LeadContext,
        appointment: AppointmentContext,
    },
    /// Internal: an outbox row is due for delivery. Published synchronously
    /// by the job queue worker.
    NotificationOutboxDue {
        tenant_id: Uuid,
        outbox_id: Uuid,
        final_attempt: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    QuoteSent,
    QuoteAccepted,
    QuoteRejected,
    AppointmentScheduled,
    AppointmentReminderDue,
    NotificationOutboxDue,
}

impl EventKind {
    /// Kinds that map onto a workflow trigger.
    pub const TRIGGERS: [EventKind; 5] = [
        EventKind::QuoteSent,
        EventKind::QuoteAccepted,
        EventKind::QuoteRejected,
        EventKind::AppointmentScheduled,
        EventKind::AppointmentReminderDue,
    ];
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::QuoteSent { .. } => EventKind::QuoteSent,
            Self::QuoteAccepted { .. } => EventKind::QuoteAccepted,
            Self::QuoteRejected { .. } => EventKind::QuoteRejected,
            Self::AppointmentScheduled { .. } => EventKind::AppointmentScheduled,
            Self::AppointmentReminderDue { .. } => EventKind::AppointmentReminderDue,
            Self::NotificationOutboxDue { .. } => EventKind::NotificationOutboxDue,
        }
    }

    pub fn trigger(&self) -> Option<WorkflowTrigger> {
        match self {
            Self::QuoteSent { .. } => Some(WorkflowTrigger::QuoteSent),
            Self::QuoteAccepted { .. } => Some(WorkflowTrigger::QuoteAccepted),
            Self::QuoteRejected { .. } => Some(WorkflowTrigger::QuoteRejected),
            Self::AppointmentScheduled { .. } => Some(WorkflowTrigger::AppointmentScheduled),
            Self::AppointmentReminderDue { .. } => Some(WorkflowTrigger::AppointmentReminder),
            Self::NotificationOutboxDue { .. } => None,
        }
    }

    pub fn lead_context(&self) -> Option<&LeadContext> {
        match self {
            Self::QuoteSent { context, .. }
            | Self::QuoteAccepted { context, .. }
            | Self::QuoteRejected { context, .. }
            | Self::AppointmentScheduled { context, .. }
            | Self::AppointmentReminderDue { context, .. } => Some(context),
            Self::NotificationOutboxDue { .. } => None,
        }
    }

    pub fn quote(&self) -> Option<&QuoteContext> {
        match self {
            Self::QuoteSent { quote, .. }
            | Self::QuoteAccepted { quote, .. }
            | Self::QuoteRejected { quote, .. } => Some(quote),
            _ => None,
        }
    }

    pub fn appointment(&self) -> Option<&AppointmentContext> {
        match self {
            Self::AppointmentScheduled { appointment, .. }
            | Self::AppointmentReminderDue { appointment, .. } => Some(appointment),
            _ => None,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), EventError>;
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        debug!("Subscribed {} to {:?}", handler.name(), kind);
        handlers.entry(kind).or_default().push(handler);
    }

    async fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Fire-and-forget: each handler runs on its own task and failures are
    /// only logged.
    pub async fn publish(&self, event: DomainEvent) {
        let event = Arc::new(event);
        for handler in self.handlers_for(event.kind()).await {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    error!(
                        permanent = e.is_permanent(),
                        "Event handler {} failed for {:?}: {}",
                        handler.name(),
                        event.kind(),
                        e
                    );
                }
            });
        }
    }

    /// Runs every subscribed handler to completion and returns the first
    /// failure, if any.
    pub async fn publish_sync(&self, event: DomainEvent) -> Result<(), EventError> {
        let handlers = self.handlers_for(event.kind()).await;
        let results = join_all(handlers.iter().map(|h| h.handle(&event))).await;

        let mut first_error = None;
        for (handler, result) in handlers.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    permanent = e.is_permanent(),
                    "Event handler {} failed for {:?}: {}",
                    handler.name(),
                    event.kind(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
