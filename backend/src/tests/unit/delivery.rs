// Unit tests for delivering due outbox rows

use leadline_shared::{Channel, OutboxStatus, WorkflowTrigger};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::events::EventError;
use crate::outbox::{MemoryOutboxStore, NewOutboxRecord, OutboxStore};
use crate::services::{Senders, UnconfiguredSender};
use crate::tests::helpers::{FailingSender, RecordingSender, StaticLeadActivity};
use crate::workflows::{DeliveryOutcome, NotificationDelivery, NotificationPayload};

fn payload(channel: Channel, recipient: &str, stop_on_reply: bool) -> NotificationPayload {
    NotificationPayload {
        channel,
        recipient: recipient.to_string(),
        subject: Some("Uw offerte".to_string()),
        body: "Hallo Jan".to_string(),
        lead_id: Uuid::new_v4(),
        workflow_id: Uuid::new_v4(),
        step_id: Uuid::new_v4(),
        trigger: WorkflowTrigger::QuoteSent,
        stop_on_reply,
    }
}

async fn enqueued_row(store: &MemoryOutboxStore, tenant_id: Uuid, payload: &NotificationPayload) -> Uuid {
    let id = store
        .insert(NewOutboxRecord::new(
            tenant_id,
            payload.channel.as_str(),
            "default.quote_sent.lead",
            serde_json::to_value(payload).unwrap(),
        ))
        .await
        .unwrap();
    store.claim_pending(1).await.unwrap();
    id
}

fn delivery(store: &MemoryOutboxStore, senders: Senders, replied: bool) -> NotificationDelivery {
    NotificationDelivery::new(Arc::new(store.clone()), senders, Arc::new(StaticLeadActivity(replied)))
}

#[tokio::test]
async fn successful_send_marks_row_succeeded() {
    let store = MemoryOutboxStore::new();
    let sender = RecordingSender::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::Email, "jan@example.com", false)).await;

    let delivery = delivery(&store, Senders::default().with(Channel::Email, Arc::new(sender.clone())), false);
    let outcome = delivery.deliver(tenant, id, false).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Sent);

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "jan@example.com");
    assert_eq!(sent[0].1.subject.as_deref(), Some("Uw offerte"));

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Succeeded);
    assert_eq!(row.attempts, 1);
}

#[tokio::test]
async fn redelivery_of_finished_rows_sends_nothing() {
    let store = MemoryOutboxStore::new();
    let sender = RecordingSender::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::Email, "jan@example.com", false)).await;

    let delivery = delivery(&store, Senders::default().with(Channel::Email, Arc::new(sender.clone())), false);
    delivery.deliver(tenant, id, false).await.unwrap();
    let again = delivery.deliver(tenant, id, false).await.unwrap();

    assert_eq!(again, DeliveryOutcome::AlreadyFinished);
    assert_eq!(sender.sent().len(), 1);
}

#[tokio::test]
async fn non_final_failure_keeps_row_open_and_records_the_error() {
    let store = MemoryOutboxStore::new();
    let sender = FailingSender::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::Email, "jan@example.com", false)).await;

    let delivery = delivery(&store, Senders::default().with(Channel::Email, Arc::new(sender.clone())), false);
    let err = delivery.deliver(tenant, id, false).await.unwrap_err();
    assert!(matches!(err, EventError::Handler(_)));

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Processing);
    assert!(row.last_error.unwrap().contains("connection refused"));

    // The queue retries; the final attempt settles the row as failed.
    assert!(delivery.deliver(tenant, id, true).await.is_err());
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempts, 2);
    assert_eq!(sender.attempts(), 2);
}

#[tokio::test]
async fn stop_on_reply_skips_the_send() {
    let store = MemoryOutboxStore::new();
    let sender = RecordingSender::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::WhatsApp, "+31612345678", true)).await;

    let delivery = delivery(&store, Senders::default().with(Channel::WhatsApp, Arc::new(sender.clone())), true);
    let outcome = delivery.deliver(tenant, id, false).await.unwrap();

    assert_eq!(outcome, DeliveryOutcome::SkippedReplied);
    assert!(sender.sent().is_empty());
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Succeeded);
}

#[tokio::test]
async fn unconfigured_channels_fail_the_attempt() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::WhatsApp, "+31612345678", false)).await;

    let senders = Senders::default().with(Channel::WhatsApp, Arc::new(UnconfiguredSender::new(Channel::WhatsApp)));
    let delivery = delivery(&store, senders, false);
    assert!(delivery.deliver(tenant, id, true).await.is_err());

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert!(row.last_error.unwrap().contains("whatsapp"));
}

#[tokio::test]
async fn foreign_tenants_and_missing_rows_are_permanent_errors() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    let id = enqueued_row(&store, tenant, &payload(Channel::Email, "jan@example.com", false)).await;
    let delivery = delivery(&store, Senders::default(), false);

    let err = delivery.deliver(Uuid::new_v4(), id, false).await.unwrap_err();
    assert!(err.is_permanent());
    let err = delivery.deliver(tenant, Uuid::new_v4(), false).await.unwrap_err();
    assert!(err.is_permanent());

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Enqueued);
}

#[tokio::test]
async fn malformed_payloads_fail_permanently() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    let id = store
        .insert(NewOutboxRecord::new(tenant, "email", "legacy", json!({"to": "jan@example.com"})))
        .await
        .unwrap();
    store.claim_pending(1).await.unwrap();

    let delivery = delivery(&store, Senders::default(), false);
    let err = delivery.deliver(tenant, id, true).await.unwrap_err();
    assert!(err.is_permanent());
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
}
