// Unit tests for turning trigger events into outbox rows

use chrono::Duration;
use leadline_shared::{Audience, Channel, OutboxStatus, OverrideMode, ResolutionSource, WorkflowTrigger};
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{AppointmentContext, Contact, DomainEvent, EventError, EventHandler};
use crate::outbox::MemoryOutboxStore;
use crate::tests::fixtures::*;
use crate::workflows::{
    MemoryWorkflowRepository, NotificationPayload, StepExecutor, WorkflowRepository, WorkflowResolver,
};

struct Harness {
    repo: MemoryWorkflowRepository,
    outbox: MemoryOutboxStore,
    executor: StepExecutor,
}

fn harness() -> Harness {
    let repo = MemoryWorkflowRepository::new();
    let outbox = MemoryOutboxStore::new();
    let executor = StepExecutor::new(WorkflowResolver::new(Arc::new(repo.clone())), Arc::new(outbox.clone()));
    Harness { repo, outbox, executor }
}

fn payload_of(record: &leadline_shared::OutboxRecord) -> NotificationPayload {
    serde_json::from_value(record.payload.clone()).unwrap()
}

#[tokio::test]
async fn quote_sent_creates_one_rendered_email_row() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let wf = quote_email_workflow(tenant, "default");
    h.repo.add_workflow(wf.clone()).await;

    let context = lead_context(tenant);
    let lead_id = context.lead_id;
    let report = h.executor.execute(&quote_sent(context)).await.unwrap();
    assert_eq!(report.source, ResolutionSource::OrganizationDefault);
    assert_eq!(report.workflow_id, Some(wf.id));
    assert_eq!(report.rows_created, 1);

    let rows = h.outbox.all().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.tenant_id, tenant);
    assert_eq!(row.kind, "email");
    assert_eq!(row.template, "default.quote_sent.lead");
    assert_eq!(row.status, OutboxStatus::Pending);

    let payload = payload_of(row);
    assert_eq!(payload.recipient, "jan@example.com");
    assert_eq!(payload.subject.as_deref(), Some("Offerte Q-2024-001"));
    assert_eq!(payload.body, "Hallo Jan, bekijk https://app.example/q/abc");
    assert_eq!(payload.lead_id, lead_id);
    assert_eq!(payload.step_id, wf.steps[0].id);
    assert_eq!(payload.trigger, WorkflowTrigger::QuoteSent);
}

#[tokio::test]
async fn delayed_steps_are_scheduled_in_the_future() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut wf = quote_email_workflow(tenant, "default");
    wf.steps[0].delay_minutes = 30;
    h.repo.add_workflow(wf).await;

    let before = minutes_from_now(30);
    h.executor.execute(&quote_sent(lead_context(tenant))).await.unwrap();
    let after = minutes_from_now(30);

    let rows = h.outbox.all().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].run_at >= before - Duration::seconds(1));
    assert!(rows[0].run_at <= after);
}

#[tokio::test]
async fn steps_without_recipients_write_nothing() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut wf = workflow(tenant, "default");
    let partner_step = step(&wf, WorkflowTrigger::QuoteSent, Channel::Email, Audience::Partner);
    wf.steps.push(partner_step);
    h.repo.add_workflow(wf).await;

    // The lead has no partner attached.
    let report = h.executor.execute(&quote_sent(lead_context(tenant))).await.unwrap();
    assert_eq!(report.rows_created, 0);
    assert_eq!(report.steps_without_recipients, 1);
    assert!(h.outbox.all().await.is_empty());
}

#[tokio::test]
async fn one_row_per_recipient_and_only_matching_triggers() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut wf = workflow(tenant, "default");

    let mut whatsapp = step(&wf, WorkflowTrigger::QuoteSent, Channel::WhatsApp, Audience::Lead);
    whatsapp.recipients.include_partner = true;
    whatsapp.recipients.phones = vec!["06-1234".to_string(), "+31 6 12345678".to_string()];
    wf.steps.push(whatsapp);

    let accepted = step(&wf, WorkflowTrigger::QuoteAccepted, Channel::Email, Audience::Lead);
    wf.steps.push(accepted);

    let mut disabled = step(&wf, WorkflowTrigger::QuoteSent, Channel::Email, Audience::Lead);
    disabled.enabled = false;
    wf.steps.push(disabled);
    h.repo.add_workflow(wf).await;

    let mut context = lead_context(tenant);
    context.partner = Some(Contact {
        name: Some("Installatie Partner".to_string()),
        email: Some("partner@example.com".to_string()),
        phone: Some("+31 6 87654321".to_string()),
    });

    let report = h.executor.execute(&quote_sent(context)).await.unwrap();
    assert_eq!(report.rows_created, 2);

    let recipients: Vec<String> = h.outbox.all().await.iter().map(|r| payload_of(r).recipient).collect();
    assert_eq!(recipients.len(), 2);
    assert!(recipients.contains(&"+31612345678".to_string()));
    assert!(recipients.contains(&"+31687654321".to_string()));
    assert!(h.outbox.all().await.iter().all(|r| r.kind == "whatsapp"));
}

#[tokio::test]
async fn legacy_placeholders_skip_only_the_broken_step() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut wf = quote_email_workflow(tenant, "default");
    let mut broken = step(&wf, WorkflowTrigger::QuoteSent, Channel::Email, Audience::Internal);
    broken.template_body = "Nieuwe offerte voor {{.LeadName}}".to_string();
    wf.steps.push(broken);
    h.repo.add_workflow(wf).await;

    let report = h.executor.execute(&quote_sent(lead_context(tenant))).await.unwrap();
    assert_eq!(report.steps_failed, 1);
    assert_eq!(report.rows_created, 1);
    assert_eq!(h.outbox.all().await.len(), 1);
}

#[tokio::test]
async fn cleared_leads_receive_nothing() {
    let h = harness();
    let tenant = Uuid::new_v4();
    h.repo.add_workflow(quote_email_workflow(tenant, "default")).await;

    let context = lead_context(tenant);
    h.repo
        .upsert_override(lead_override(tenant, context.lead_id, OverrideMode::Clear, None))
        .await
        .unwrap();

    let report = h.executor.execute(&quote_sent(context)).await.unwrap();
    assert_eq!(report.source, ResolutionSource::ManualClear);
    assert_eq!(report.rows_created, 0);
    assert!(h.outbox.all().await.is_empty());
}

#[tokio::test]
async fn appointment_reminders_render_local_date_and_time() {
    let h = harness();
    let tenant = Uuid::new_v4();
    let mut wf = workflow(tenant, "default");
    let mut reminder = step(&wf, WorkflowTrigger::AppointmentReminder, Channel::Email, Audience::Lead);
    reminder.template_subject = None;
    reminder.template_body = "Tot {{appointment.date}} om {{appointment.time}} in {{appointment.location}}".to_string();
    wf.steps.push(reminder);
    h.repo.add_workflow(wf).await;

    let starts_at = chrono::DateTime::parse_from_rfc3339("2024-06-03T09:30:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let event = DomainEvent::AppointmentReminderDue {
        context: lead_context(tenant),
        appointment: AppointmentContext {
            appointment_id: Uuid::new_v4(),
            starts_at,
            location: Some("Utrecht".to_string()),
            user_id: None,
        },
    };
    h.executor.execute(&event).await.unwrap();

    let rows = h.outbox.all().await;
    let payload = payload_of(&rows[0]);
    assert_eq!(rows[0].template, "default.appointment_reminder.lead");
    assert!(payload.subject.is_none());
    assert_eq!(payload.body, "Tot 03-06-2024 om 09:30 in Utrecht");
}

#[tokio::test]
async fn non_trigger_events_are_rejected() {
    let h = harness();
    let event = DomainEvent::NotificationOutboxDue {
        tenant_id: Uuid::new_v4(),
        outbox_id: Uuid::new_v4(),
        final_attempt: false,
    };
    assert!(matches!(h.executor.handle(&event).await, Err(EventError::Invalid(_))));
}

#[tokio::test]
async fn failed_write_leaves_no_partial_schedule() {
    let repo = MemoryWorkflowRepository::new();
    let tenant = Uuid::new_v4();
    let mut wf = quote_email_workflow(tenant, "default");
    let internal = step(&wf, WorkflowTrigger::QuoteSent, Channel::Email, Audience::Internal);
    wf.steps.push(internal);
    repo.add_workflow(wf.clone()).await;

    let outbox = Arc::new(crate::tests::helpers::FlakyOutbox::new());
    let executor = StepExecutor::new(WorkflowResolver::new(Arc::new(repo)), outbox.clone());
    let event = quote_sent(lead_context(tenant));

    assert!(matches!(executor.execute(&event).await, Err(EventError::Handler(_))));
    assert!(outbox.inner.all().await.is_empty());

    // The redelivered event writes each step exactly once.
    let report = executor.execute(&event).await.unwrap();
    assert_eq!(report.rows_created, 2);
    let rows = outbox.inner.all().await;
    assert_eq!(rows.len(), 2);
    let mut steps: Vec<Uuid> = rows.iter().map(|r| payload_of(r).step_id).collect();
    steps.sort();
    let mut expected: Vec<Uuid> = wf.steps.iter().map(|s| s.id).collect();
    expected.sort();
    assert_eq!(steps, expected);
}
