// Task kinds and their wire payloads

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{QueueResult, Task};

pub const OUTBOX_DUE: &str = "outbox.due";
pub const APPOINTMENT_REMINDER: &str = "appointment.reminder";
pub const QUOTE_GENERATE: &str = "quote.generate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxDuePayload {
    pub outbox_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentReminderPayload {
    pub appointment_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteGeneratePayload {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<Uuid>,
}

pub fn outbox_due(payload: &OutboxDuePayload) -> QueueResult<Task> {
    Task::new(OUTBOX_DUE, payload)
}

pub fn appointment_reminder(payload: &AppointmentReminderPayload) -> QueueResult<Task> {
    Task::new(APPOINTMENT_REMINDER, payload)
}

pub fn quote_generate(payload: &QuoteGeneratePayload) -> QueueResult<Task> {
    Task::new(QUOTE_GENERATE, payload)
}
