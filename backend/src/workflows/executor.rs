// Step Executor - turns trigger events into outbox rows

use async_trait::async_trait;
use chrono::{Duration, Utc};
use leadline_shared::{Channel, ResolutionSource, Workflow, WorkflowStep, WorkflowTrigger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::recipients::resolve_recipients;
use super::resolver::{ResolveInput, WorkflowResolver};
use super::template::{render, TemplateError};
use crate::events::{DomainEvent, EventError, EventHandler, LeadContext};
use crate::outbox::{NewOutboxRecord, OutboxStore};

/// Rendered message stored on an outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub lead_id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub stop_on_reply: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub source: ResolutionSource,
    pub workflow_id: Option<Uuid>,
    pub rows_created: usize,
    pub steps_without_recipients: usize,
    pub steps_failed: usize,
}

impl ExecutionReport {
    fn empty(source: ResolutionSource) -> Self {
        Self {
            source,
            workflow_id: None,
            rows_created: 0,
            steps_without_recipients: 0,
            steps_failed: 0,
        }
    }
}

fn first_name(name: Option<&str>) -> Option<&str> {
    name.and_then(|n| n.split_whitespace().next())
}

/// Variables visible to step templates.
pub fn template_env(event: &DomainEvent, context: &LeadContext, workflow: &Workflow) -> Value {
    let lead_name = context.lead.name.as_deref();
    let organization = &context.organization;

    let valid_days = workflow.quote_valid_days_override.or(organization.quote_valid_days);
    let payment_days = workflow.quote_payment_days_override.or(organization.quote_payment_days);

    let quote = event.quote().map(|q| {
        json!({
            "id": q.quote_id,
            "number": q.quote_number,
            "total": q.total.map(|t| t.round_dp(2).to_string()),
            "link": q.public_link,
            "valid_days": valid_days,
            "payment_days": payment_days,
        })
    });

    let appointment = event.appointment().map(|a| {
        json!({
            "id": a.appointment_id,
            "starts_at": a.starts_at.to_rfc3339(),
            "date": a.starts_at.format("%d-%m-%Y").to_string(),
            "time": a.starts_at.format("%H:%M").to_string(),
            "location": a.location,
        })
    });

    let partner = context.partner.as_ref().map(|p| {
        json!({
            "name": p.name,
            "first_name": first_name(p.name.as_deref()),
            "email": p.email,
            "phone": p.phone,
        })
    });

    json!({
        "lead": {
            "id": context.lead_id,
            "name": lead_name,
            "first_name": first_name(lead_name),
            "email": context.lead.email,
            "phone": context.lead.phone,
            "source": context.lead_source,
        },
        "partner": partner,
        "organization": {
            "name": organization.name,
            "email": organization.email,
            "phone": organization.phone,
        },
        "quote": quote,
        "appointment": appointment,
        "links": {
            "quote": event.quote().and_then(|q| q.public_link.clone()),
        },
        "workflow": {
            "key": workflow.key,
            "name": workflow.name,
        },
    })
}

struct RenderedStep {
    subject: Option<String>,
    body: String,
}

fn render_step(step: &WorkflowStep, env: &Value) -> Result<RenderedStep, TemplateError> {
    let subject = match step.template_subject.as_deref() {
        Some(subject) if !subject.trim().is_empty() => Some(render(subject, env)?),
        _ => None,
    };
    let body = render(&step.template_body, env)?;
    Ok(RenderedStep { subject, body })
}

pub struct StepExecutor {
    resolver: WorkflowResolver,
    outbox: Arc<dyn OutboxStore>,
    default_country_code: Option<String>,
}

impl StepExecutor {
    pub fn new(resolver: WorkflowResolver, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            resolver,
            outbox,
            default_country_code: None,
        }
    }

    /// Country calling code used for phone numbers written without one.
    pub fn with_default_country_code(mut self, code: Option<String>) -> Self {
        self.default_country_code = code;
        self
    }

    /// Resolves the lead's workflow and writes one outbox row per recipient
    /// of every enabled step listening for the event's trigger.
    pub async fn execute(&self, event: &DomainEvent) -> Result<ExecutionReport, EventError> {
        let (Some(trigger), Some(context)) = (event.trigger(), event.lead_context()) else {
            return Err(EventError::Invalid(format!("{:?} is not a workflow trigger", event.kind())));
        };

        let input = ResolveInput {
            lead_source: context.lead_source.clone(),
            lead_service_type: context.lead_service_type.clone(),
            pipeline_stage: context.pipeline_stage.clone(),
        };

        let resolution = self
            .resolver
            .resolve_effective(context.tenant_id, context.lead_id, &input)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;

        let mut report = ExecutionReport::empty(resolution.source);
        let Some(workflow) = resolution.workflow else {
            debug!(lead_id = %context.lead_id, source = %resolution.source, "No workflow for lead");
            return Ok(report);
        };
        report.workflow_id = Some(workflow.id);

        let env = template_env(event, context, &workflow);
        let now = Utc::now();
        let mut rows = Vec::new();

        for step in workflow.steps_for(trigger) {
            let recipients = resolve_recipients(step, context, self.default_country_code.as_deref());
            if recipients.is_empty() {
                debug!(step_id = %step.id, "Step has no recipients, skipping");
                report.steps_without_recipients += 1;
                continue;
            }

            let rendered = match render_step(step, &env) {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(step_id = %step.id, workflow_id = %workflow.id, "Skipping step: {}", e);
                    report.steps_failed += 1;
                    continue;
                }
            };

            let run_at = if step.delay_minutes > 0 {
                now + Duration::minutes(i64::from(step.delay_minutes))
            } else {
                now
            };
            let template = format!("{}.{}.{}", workflow.key, trigger, step.audience);

            for recipient in recipients {
                let payload = NotificationPayload {
                    channel: step.channel,
                    recipient,
                    subject: rendered.subject.clone(),
                    body: rendered.body.clone(),
                    lead_id: context.lead_id,
                    workflow_id: workflow.id,
                    step_id: step.id,
                    trigger,
                    stop_on_reply: step.stop_on_reply,
                };
                let payload = serde_json::to_value(&payload).map_err(|e| EventError::Handler(e.to_string()))?;

                rows.push(
                    NewOutboxRecord::new(context.tenant_id, step.channel.as_str(), template.as_str(), payload)
                        .run_at(run_at),
                );
            }
        }

        // Rows of one event are written all or nothing.
        report.rows_created = self
            .outbox
            .insert_many(rows)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?
            .len();

        info!(
            lead_id = %context.lead_id,
            workflow_id = %workflow.id,
            %trigger,
            rows = report.rows_created,
            "Scheduled workflow notifications"
        );
        Ok(report)
    }
}

#[async_trait]
impl EventHandler for StepExecutor {
    fn name(&self) -> &'static str {
        "workflow-step-executor"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), EventError> {
        self.execute(event).await.map(|_| ())
    }
}
