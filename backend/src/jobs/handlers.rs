// Task handlers for the notification queue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::tasks::{AppointmentReminderPayload, OutboxDuePayload, QuoteGeneratePayload};
use crate::events::{AppointmentContext, Contact, DomainEvent, EventBus, LeadContext, OrganizationContext};
use crate::queue::{TaskContext, TaskError, TaskHandler};
use crate::workflows::WorkflowResult;

/// Republishes `outbox.due` as a synchronous domain event so delivery
/// failures surface as task failures.
pub struct OutboxDueHandler {
    bus: Arc<EventBus>,
}

impl OutboxDueHandler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl TaskHandler for OutboxDueHandler {
    async fn process(&self, ctx: &TaskContext, payload: &serde_json::Value) -> Result<(), TaskError> {
        let payload: OutboxDuePayload = serde_json::from_value(payload.clone())?;
        debug!(task_id = %ctx.task_id, outbox_id = %payload.outbox_id, retried = ctx.retried, "Outbox row due");

        self.bus
            .publish_sync(DomainEvent::NotificationOutboxDue {
                tenant_id: payload.tenant_id,
                outbox_id: payload.outbox_id,
                final_attempt: ctx.is_final_attempt(),
            })
            .await?;
        Ok(())
    }
}

// ===== Appointment reminders =====

#[derive(Debug, Clone)]
pub struct ReminderContext {
    pub lead: LeadContext,
    pub appointment: AppointmentContext,
}

/// Looks up everything a reminder needs about an appointment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppointmentDirectory: Send + Sync {
    /// `None` when the appointment is gone or no longer scheduled.
    async fn reminder_context(&self, tenant_id: Uuid, appointment_id: Uuid) -> WorkflowResult<Option<ReminderContext>>;
}

#[derive(Debug, FromRow)]
struct ReminderRow {
    appointment_id: Uuid,
    starts_at: DateTime<Utc>,
    location: Option<String>,
    user_id: Option<Uuid>,
    lead_id: Uuid,
    lead_name: Option<String>,
    lead_email: Option<String>,
    lead_phone: Option<String>,
    lead_source: Option<String>,
    lead_service_type: Option<String>,
    pipeline_stage: Option<String>,
    partner_name: Option<String>,
    partner_email: Option<String>,
    partner_phone: Option<String>,
    organization_name: String,
    organization_email: Option<String>,
    organization_phone: Option<String>,
    quote_valid_days: Option<i32>,
    quote_payment_days: Option<i32>,
}

/// Reads the CRM's appointment, lead, partner and organization tables.
#[derive(Clone)]
pub struct PgAppointmentDirectory {
    pool: PgPool,
}

impl PgAppointmentDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppointmentDirectory for PgAppointmentDirectory {
    async fn reminder_context(&self, tenant_id: Uuid, appointment_id: Uuid) -> WorkflowResult<Option<ReminderContext>> {
        let row = sqlx::query_as::<_, ReminderRow>(
            r#"
            SELECT a.id AS appointment_id, a.starts_at, a.location, a.user_id,
                   l.id AS lead_id, l.name AS lead_name, l.email AS lead_email, l.phone AS lead_phone,
                   l.source AS lead_source, l.service_type AS lead_service_type, l.pipeline_stage,
                   p.name AS partner_name, p.email AS partner_email, p.phone AS partner_phone,
                   o.name AS organization_name, o.email AS organization_email, o.phone AS organization_phone,
                   o.quote_valid_days, o.quote_payment_days
            FROM appointments a
            JOIN leads l ON l.id = a.lead_id AND l.tenant_id = a.tenant_id
            JOIN organizations o ON o.id = a.tenant_id
            LEFT JOIN partners p ON p.id = l.partner_id AND p.tenant_id = a.tenant_id
            WHERE a.tenant_id = $1 AND a.id = $2 AND a.status = 'scheduled'
            "#,
        )
        .bind(tenant_id)
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let partner = (row.partner_name.is_some() || row.partner_email.is_some() || row.partner_phone.is_some())
                .then(|| Contact {
                    name: row.partner_name,
                    email: row.partner_email,
                    phone: row.partner_phone,
                });

            ReminderContext {
                lead: LeadContext {
                    tenant_id,
                    lead_id: row.lead_id,
                    lead: Contact {
                        name: row.lead_name,
                        email: row.lead_email,
                        phone: row.lead_phone,
                    },
                    lead_source: row.lead_source,
                    lead_service_type: row.lead_service_type,
                    pipeline_stage: row.pipeline_stage,
                    partner,
                    organization: OrganizationContext {
                        name: row.organization_name,
                        email: row.organization_email,
                        phone: row.organization_phone,
                        quote_valid_days: row.quote_valid_days,
                        quote_payment_days: row.quote_payment_days,
                    },
                },
                appointment: AppointmentContext {
                    appointment_id: row.appointment_id,
                    starts_at: row.starts_at,
                    location: row.location,
                    user_id: row.user_id,
                },
            }
        }))
    }
}

pub struct AppointmentReminderHandler {
    directory: Arc<dyn AppointmentDirectory>,
    bus: Arc<EventBus>,
}

impl AppointmentReminderHandler {
    pub fn new(directory: Arc<dyn AppointmentDirectory>, bus: Arc<EventBus>) -> Self {
        Self { directory, bus }
    }
}

#[async_trait]
impl TaskHandler for AppointmentReminderHandler {
    async fn process(&self, _ctx: &TaskContext, payload: &serde_json::Value) -> Result<(), TaskError> {
        let payload: AppointmentReminderPayload = serde_json::from_value(payload.clone())?;

        let found = self
            .directory
            .reminder_context(payload.tenant_id, payload.appointment_id)
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;

        let Some(found) = found else {
            info!(appointment_id = %payload.appointment_id, "Appointment no longer scheduled, skipping reminder");
            return Ok(());
        };

        let mut appointment = found.appointment;
        if appointment.user_id.is_none() {
            appointment.user_id = payload.user_id;
        }

        self.bus
            .publish_sync(DomainEvent::AppointmentReminderDue {
                context: found.lead,
                appointment,
            })
            .await?;
        Ok(())
    }
}

// ===== Quote generation =====

/// The quote service that owns `quote_generation_jobs`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteProcessor: Send + Sync {
    async fn process(&self, tenant_id: Uuid, job_id: Uuid, lead_id: Option<Uuid>) -> Result<(), TaskError>;
}

/// Hands the job to the quote service over HTTP.
pub struct HttpQuoteProcessor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteProcessor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QuoteProcessor for HttpQuoteProcessor {
    async fn process(&self, tenant_id: Uuid, job_id: Uuid, lead_id: Option<Uuid>) -> Result<(), TaskError> {
        let url = format!("{}/internal/quote-jobs/{}/process", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "tenantId": tenant_id, "leadId": lead_id }))
            .send()
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(TaskError::Invalid(format!("quote service rejected job {}: {} {}", job_id, status, body)))
        } else {
            Err(TaskError::Failed(format!("quote service error for job {}: {} {}", job_id, status, body)))
        }
    }
}

pub struct QuoteGenerationHandler {
    processor: Arc<dyn QuoteProcessor>,
}

impl QuoteGenerationHandler {
    pub fn new(processor: Arc<dyn QuoteProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl TaskHandler for QuoteGenerationHandler {
    async fn process(&self, ctx: &TaskContext, payload: &serde_json::Value) -> Result<(), TaskError> {
        let payload: QuoteGeneratePayload = serde_json::from_value(payload.clone())?;
        info!(task_id = %ctx.task_id, job_id = %payload.job_id, "Generating quote");
        self.processor
            .process(payload.tenant_id, payload.job_id, payload.lead_id)
            .await
    }
}
