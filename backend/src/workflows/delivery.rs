// Notification Delivery - sends a due outbox row through its channel sender

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadline_shared::OutboxRecord;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::executor::NotificationPayload;
use super::repository::WorkflowResult;
use crate::events::{DomainEvent, EventError, EventHandler};
use crate::outbox::OutboxStore;
use crate::services::{OutboundMessage, Senders};

/// Inbound activity used to honor `stop_on_reply`.
#[async_trait]
pub trait LeadActivity: Send + Sync {
    async fn has_replied_since(&self, tenant_id: Uuid, lead_id: Uuid, since: DateTime<Utc>) -> WorkflowResult<bool>;
}

#[derive(Clone)]
pub struct PgLeadActivity {
    pool: PgPool,
}

impl PgLeadActivity {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadActivity for PgLeadActivity {
    async fn has_replied_since(&self, tenant_id: Uuid, lead_id: Uuid, since: DateTime<Utc>) -> WorkflowResult<bool> {
        let replied: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM lead_replies
                WHERE tenant_id = $1 AND lead_id = $2 AND received_at > $3
            )
            "#,
        )
        .bind(tenant_id)
        .bind(lead_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(replied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// The lead replied after the row was scheduled.
    SkippedReplied,
    /// Redelivery of a row that already reached a terminal state.
    AlreadyFinished,
}

pub struct NotificationDelivery {
    outbox: Arc<dyn OutboxStore>,
    senders: Senders,
    activity: Arc<dyn LeadActivity>,
}

impl NotificationDelivery {
    pub fn new(outbox: Arc<dyn OutboxStore>, senders: Senders, activity: Arc<dyn LeadActivity>) -> Self {
        Self { outbox, senders, activity }
    }

    pub async fn deliver(&self, tenant_id: Uuid, outbox_id: Uuid, final_attempt: bool) -> Result<DeliveryOutcome, EventError> {
        let record = self
            .outbox
            .get_by_id(outbox_id)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?
            .ok_or_else(|| EventError::Invalid(format!("outbox record {} not found", outbox_id)))?;

        if record.tenant_id != tenant_id {
            return Err(EventError::Invalid(format!(
                "outbox record {} does not belong to tenant {}",
                outbox_id, tenant_id
            )));
        }

        if record.status.is_terminal() {
            info!(%outbox_id, status = %record.status, "Outbox record already finished, skipping");
            return Ok(DeliveryOutcome::AlreadyFinished);
        }

        self.outbox
            .mark_processing(outbox_id)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;

        match self.attempt(&record).await {
            Ok(outcome) => {
                self.outbox
                    .mark_succeeded(outbox_id)
                    .await
                    .map_err(|e| EventError::Handler(e.to_string()))?;
                info!(%outbox_id, ?outcome, "Outbox record delivered");
                Ok(outcome)
            }
            Err(e) => {
                let reason = e.to_string();
                let recorded = if final_attempt {
                    self.outbox.mark_failed(outbox_id, &reason).await
                } else {
                    self.outbox.record_attempt_error(outbox_id, &reason).await
                };
                if let Err(store_err) = recorded {
                    warn!(%outbox_id, "Could not record delivery failure: {}", store_err);
                }
                warn!(%outbox_id, final_attempt, "Delivery attempt failed: {}", reason);
                Err(e)
            }
        }
    }

    async fn attempt(&self, record: &OutboxRecord) -> Result<DeliveryOutcome, EventError> {
        let payload: NotificationPayload = serde_json::from_value(record.payload.clone())
            .map_err(|e| EventError::Invalid(format!("malformed notification payload: {}", e)))?;

        if payload.stop_on_reply {
            let replied = self
                .activity
                .has_replied_since(record.tenant_id, payload.lead_id, record.created_at)
                .await
                .map_err(|e| EventError::Handler(e.to_string()))?;
            if replied {
                return Ok(DeliveryOutcome::SkippedReplied);
            }
        }

        let sender = self
            .senders
            .get(payload.channel)
            .map_err(|e| EventError::Handler(e.to_string()))?;
        let message = OutboundMessage {
            subject: payload.subject,
            body: payload.body,
        };
        sender
            .send(&payload.recipient, &message)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;

        Ok(DeliveryOutcome::Sent)
    }
}

#[async_trait]
impl EventHandler for NotificationDelivery {
    fn name(&self) -> &'static str {
        "notification-delivery"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), EventError> {
        match event {
            DomainEvent::NotificationOutboxDue { tenant_id, outbox_id, final_attempt } => {
                self.deliver(*tenant_id, *outbox_id, *final_attempt).await.map(|_| ())
            }
            other => Err(EventError::Invalid(format!("unexpected event {:?}", other.kind()))),
        }
    }
}
