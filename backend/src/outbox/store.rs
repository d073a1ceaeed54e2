// Outbox Store - state machine and concurrent-claim contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadline_shared::{OutboxRecord, OutboxStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid outbox record: {0}")]
    Validation(String),
    #[error("Outbox record {0} not found")]
    NotFound(Uuid),
    #[error("Outbox record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: OutboxStatus,
        to: OutboxStatus,
    },
    #[error("Corrupt outbox row: {0}")]
    Corrupt(String),
}

pub type OutboxResult<T> = Result<T, OutboxError>;

/// Insert request. `run_at` defaults to now and `status` to `pending`.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub tenant_id: Uuid,
    pub kind: String,
    pub template: String,
    pub payload: serde_json::Value,
    pub run_at: Option<DateTime<Utc>>,
    pub status: Option<OutboxStatus>,
}

impl NewOutboxRecord {
    pub fn new(
        tenant_id: Uuid,
        kind: impl Into<String>,
        template: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            kind: kind.into(),
            template: template.into(),
            payload,
            run_at: None,
            status: None,
        }
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn status(mut self, status: OutboxStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn validate(&self) -> OutboxResult<()> {
        if self.tenant_id.is_nil() {
            return Err(OutboxError::Validation("tenant id is required".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(OutboxError::Validation("kind is required".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(OutboxError::Validation("template is required".to_string()));
        }
        Ok(())
    }
}

/// How a transition treats `last_error`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ErrorUpdate<'a> {
    Keep,
    Clear,
    Set(&'a str),
}

/// Every status a record may be in when moving to `to`.
pub(crate) fn allowed_sources(to: OutboxStatus) -> Vec<OutboxStatus> {
    [
        OutboxStatus::Pending,
        OutboxStatus::Enqueued,
        OutboxStatus::Processing,
        OutboxStatus::Succeeded,
        OutboxStatus::Failed,
    ]
    .into_iter()
    .filter(|from| from.can_transition_to(to))
    .collect()
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, record: NewOutboxRecord) -> OutboxResult<Uuid>;

    /// Inserts every record or none of them. Ids come back in input order.
    async fn insert_many(&self, records: Vec<NewOutboxRecord>) -> OutboxResult<Vec<Uuid>>;

    /// Select up to `limit` due `pending` rows ordered by `run_at` and flip
    /// them to `enqueued` atomically. Concurrent callers never receive the
    /// same row.
    async fn claim_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxRecord>>;

    /// Increments the attempt counter.
    async fn mark_processing(&self, id: Uuid) -> OutboxResult<()>;

    async fn mark_succeeded(&self, id: Uuid) -> OutboxResult<()>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> OutboxResult<()>;

    /// Revert to `pending` after an enqueue-time failure.
    async fn mark_pending(&self, id: Uuid, reason: Option<&str>) -> OutboxResult<()>;

    /// Store the error of a delivery attempt the job queue will retry.
    async fn record_attempt_error(&self, id: Uuid, reason: &str) -> OutboxResult<()>;

    async fn get_by_id(&self, id: Uuid) -> OutboxResult<Option<OutboxRecord>>;

    /// Delete terminal rows last updated before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> OutboxResult<u64>;

    /// Return rows left `enqueued` since before `before` to `pending`. A row
    /// stays that way when its claimer dies between claim and enqueue.
    async fn release_stale_claims(&self, before: DateTime<Utc>) -> OutboxResult<u64>;
}

pub(crate) const STALE_CLAIM_ERROR: &str = "claim released: task was never picked up";
