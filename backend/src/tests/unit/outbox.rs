// Unit tests for the in-memory outbox store

use chrono::{Duration, Utc};
use leadline_shared::OutboxStatus;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::outbox::{MemoryOutboxStore, NewOutboxRecord, OutboxError, OutboxStore};

fn record(tenant_id: Uuid) -> NewOutboxRecord {
    NewOutboxRecord::new(tenant_id, "email", "default.quote_sent.lead", json!({"body": "hi"}))
}

#[tokio::test]
async fn claim_returns_only_due_pending_rows_in_run_at_order() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();

    let later = store.insert(record(tenant).run_at(Utc::now() - Duration::minutes(1))).await.unwrap();
    let earlier = store.insert(record(tenant).run_at(Utc::now() - Duration::minutes(5))).await.unwrap();
    let future = store.insert(record(tenant).run_at(Utc::now() + Duration::hours(1))).await.unwrap();
    store
        .insert(record(tenant).status(OutboxStatus::Succeeded))
        .await
        .unwrap();

    let claimed = store.claim_pending(10).await.unwrap();
    let ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![earlier, later]);
    assert!(claimed.iter().all(|r| r.status == OutboxStatus::Enqueued));

    let future = store.get_by_id(future).await.unwrap().unwrap();
    assert_eq!(future.status, OutboxStatus::Pending);

    // Claimed rows are not handed out twice.
    assert!(store.claim_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_respects_batch_limit() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    for _ in 0..5 {
        store.insert(record(tenant)).await.unwrap();
    }

    assert_eq!(store.claim_pending(2).await.unwrap().len(), 2);
    assert_eq!(store.claim_pending(0).await.unwrap().len(), 0);
    assert_eq!(store.claim_pending(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_claims_never_share_a_row() {
    let store = Arc::new(MemoryOutboxStore::new());
    let tenant = Uuid::new_v4();
    for _ in 0..100 {
        store.insert(record(tenant)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_pending(7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|r| r.id));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
}

#[tokio::test]
async fn delivery_transitions_follow_the_state_machine() {
    let store = MemoryOutboxStore::new();
    let id = store.insert(record(Uuid::new_v4())).await.unwrap();
    store.claim_pending(1).await.unwrap();

    store.mark_processing(id).await.unwrap();
    store.record_attempt_error(id, "smtp timeout").await.unwrap();
    store.mark_processing(id).await.unwrap();

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Processing);
    assert_eq!(row.attempts, 2);
    assert_eq!(row.last_error.as_deref(), Some("smtp timeout"));

    store.mark_succeeded(id).await.unwrap();
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Succeeded);
    assert!(row.last_error.is_none());

    let err = store.mark_processing(id).await.unwrap_err();
    assert!(matches!(
        err,
        OutboxError::InvalidTransition {
            from: OutboxStatus::Succeeded,
            to: OutboxStatus::Processing,
            ..
        }
    ));
    assert!(store.mark_failed(id, "late failure").await.is_err());
}

#[tokio::test]
async fn reverted_rows_keep_the_enqueue_error() {
    let store = MemoryOutboxStore::new();
    let id = store.insert(record(Uuid::new_v4())).await.unwrap();
    store.claim_pending(1).await.unwrap();

    store.mark_pending(id, Some("enqueue failed: broken pipe")).await.unwrap();
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.last_error.as_deref(), Some("enqueue failed: broken pipe"));

    assert_eq!(store.claim_pending(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_ids_and_invalid_records_are_rejected() {
    let store = MemoryOutboxStore::new();
    let missing = Uuid::new_v4();
    assert!(matches!(store.mark_succeeded(missing).await, Err(OutboxError::NotFound(id)) if id == missing));
    assert!(store.get_by_id(missing).await.unwrap().is_none());

    let blank = NewOutboxRecord::new(Uuid::new_v4(), " ", "template", json!({}));
    assert!(matches!(store.insert(blank).await, Err(OutboxError::Validation(_))));
}

#[tokio::test]
async fn purge_removes_only_old_terminal_rows() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    let done = store.insert(record(tenant)).await.unwrap();
    let waiting = store
        .insert(record(tenant).run_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    store.claim_pending(1).await.unwrap();
    store.mark_succeeded(done).await.unwrap();

    assert_eq!(store.purge_finished(Utc::now() - Duration::hours(1)).await.unwrap(), 0);
    assert_eq!(store.purge_finished(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);

    assert!(store.get_by_id(done).await.unwrap().is_none());
    assert!(store.get_by_id(waiting).await.unwrap().is_some());
}

#[tokio::test]
async fn batch_insert_is_all_or_nothing() {
    let store = MemoryOutboxStore::new();
    let tenant = Uuid::new_v4();
    let blank = NewOutboxRecord::new(tenant, "email", " ", json!({}));

    let result = store.insert_many(vec![record(tenant), blank]).await;
    assert!(matches!(result, Err(OutboxError::Validation(_))));
    assert!(store.all().await.is_empty());

    assert!(store.insert_many(Vec::new()).await.unwrap().is_empty());
    let ids = store.insert_many(vec![record(tenant), record(tenant)]).await.unwrap();
    assert_eq!(ids.len(), 2);
    for id in ids {
        assert!(store.get_by_id(id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn stale_claims_are_released_for_another_claim() {
    let store = MemoryOutboxStore::new();
    let id = store.insert(record(Uuid::new_v4())).await.unwrap();
    store.claim_pending(1).await.unwrap();

    assert_eq!(store.release_stale_claims(Utc::now() - Duration::minutes(5)).await.unwrap(), 0);
    assert_eq!(store.release_stale_claims(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert!(row.last_error.is_some());
    assert_eq!(store.claim_pending(1).await.unwrap()[0].id, id);
}
