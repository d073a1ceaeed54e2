use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Returned when a stored symbolic value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! symbolic_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

/// Delivery channel of a workflow step. `WhatsApp` is the chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "whatsapp")]
    WhatsApp,
}

symbolic_enum!(Channel, "channel", { Email => "email", WhatsApp => "whatsapp" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Lead,
    Partner,
    Internal,
}

symbolic_enum!(Audience, "audience", { Lead => "lead", Partner => "partner", Internal => "internal" });

/// Domain events a workflow step can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    QuoteSent,
    QuoteAccepted,
    QuoteRejected,
    AppointmentScheduled,
    AppointmentReminder,
}

symbolic_enum!(WorkflowTrigger, "trigger", {
    QuoteSent => "quote_sent",
    QuoteAccepted => "quote_accepted",
    QuoteRejected => "quote_rejected",
    AppointmentScheduled => "appointment_scheduled",
    AppointmentReminder => "appointment_reminder",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    /// Pins a specific workflow.
    Manual,
    /// Disables automatic assignment for the lead.
    Clear,
}

symbolic_enum!(OverrideMode, "override mode", { Manual => "manual", Clear => "clear" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    ManualOverride,
    ManualClear,
    AutoRule,
    OrganizationDefault,
}

symbolic_enum!(ResolutionSource, "resolution source", {
    ManualOverride => "manual_override",
    ManualClear => "manual_clear",
    AutoRule => "auto_rule",
    OrganizationDefault => "organization_default",
});

/// Outbox state machine:
/// `pending -> enqueued -> processing -> {succeeded | failed}`, with
/// `enqueued` and `processing` able to revert to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
}

symbolic_enum!(OutboxStatus, "outbox status", {
    Pending => "pending",
    Enqueued => "enqueued",
    Processing => "processing",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the store may move a record from `self` to `next`.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;
        match (self, next) {
            (Pending, Enqueued) => true,
            // A row reverted after an ambiguous enqueue may still be delivered.
            (Pending, Processing) => true,
            (Enqueued, Processing) | (Processing, Processing) => true,
            (Enqueued, Pending) | (Processing, Pending) => true,
            (Enqueued, Succeeded) | (Processing, Succeeded) => true,
            (Enqueued, Failed) | (Processing, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

symbolic_enum!(QuoteJobStatus, "quote job status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientConfig {
    #[serde(default)]
    pub include_lead: bool,
    #[serde(default)]
    pub include_partner: bool,
    #[serde(default)]
    pub include_organization: bool,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Presentation order only; matching steps fire independently.
    pub step_order: i32,
    pub trigger: WorkflowTrigger,
    pub channel: Channel,
    pub audience: Audience,
    #[serde(default)]
    pub recipients: RecipientConfig,
    pub template_subject: Option<String>,
    pub template_body: String,
    pub delay_minutes: i32,
    pub enabled: bool,
    pub stop_on_reply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub quote_valid_days_override: Option<i32>,
    pub quote_payment_days_override: Option<i32>,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Enabled steps listening for `trigger`, in presentation order.
    pub fn steps_for(&self, trigger: WorkflowTrigger) -> impl Iterator<Item = &WorkflowStep> {
        self.steps
            .iter()
            .filter(move |s| s.enabled && s.trigger == trigger)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAssignmentRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub lead_source: Option<String>,
    pub lead_service_type: Option<String>,
    pub pipeline_stage: Option<String>,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadWorkflowOverride {
    pub lead_id: Uuid,
    pub tenant_id: Uuid,
    pub mode: OverrideMode,
    pub workflow_id: Option<Uuid>,
    pub reason: Option<String>,
    pub assigned_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: String,
    pub template: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
