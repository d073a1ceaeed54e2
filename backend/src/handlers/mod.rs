use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::database;
use crate::events::{DomainEvent, EventKind};
use crate::jobs::tasks::{self, AppointmentReminderPayload, QuoteGeneratePayload};
use crate::queue::{DeadLetter, EnqueueOptions, TaskInfo};
use crate::{ApiError, ApiResult, AppState};
use leadline_shared::OutboxRecord;

const MAX_DEAD_LETTERS: usize = 500;

/// Operational and intake routes; `main` adds the middleware layers.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/events", post(publish_event))
        .nest("/api/v1/outbox", outbox_routes())
        .nest("/api/v1/queue", queue_routes())
}

pub fn outbox_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id", get(get_outbox_record))
}

pub fn queue_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dead-letters", get(list_dead_letters))
        .route("/appointment-reminders", post(schedule_appointment_reminder))
        .route("/quote-jobs", post(enqueue_quote_job))
}

/// Reports whether Postgres and the queue broker are reachable.
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database = database::health_check(&state.db_pool).await;
    let queue = match state.client.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Queue health check failed: {}", e);
            false
        }
    };

    let status = if database && queue {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "degraded" },
            "service": "leadline-notifications",
            "database": database,
            "queue": queue,
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishQuery {
    /// `false` returns as soon as the event is handed to the bus.
    pub wait: Option<bool>,
}

/// Accepts a domain event from the CRM. By default the workflow steps are
/// evaluated before responding, so a 202 means the outbox rows are stored.
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PublishQuery>,
    Json(event): Json<DomainEvent>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let kind = event.kind();
    if kind == EventKind::NotificationOutboxDue {
        return Err(ApiError::bad_request("notification_outbox_due is published by the job queue only"));
    }

    let wait = query.wait.unwrap_or(true);
    if wait {
        state.bus.publish_sync(event).await?;
    } else {
        state.bus.publish(event).await;
    }

    tracing::info!(event = ?kind, wait, "Accepted domain event");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event": format!("{:?}", kind),
            "status": if wait { "processed" } else { "accepted" },
        })),
    ))
}

pub async fn get_outbox_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<OutboxRecord>> {
    let record = state
        .outbox
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Outbox record {}", id)))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

pub async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetter>>> {
    let limit = query.limit.unwrap_or(50);
    if limit == 0 || limit > MAX_DEAD_LETTERS {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_DEAD_LETTERS
        )));
    }
    Ok(Json(state.client.dead_letters(limit).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReminderRequest {
    #[serde(flatten)]
    pub payload: AppointmentReminderPayload,
    /// When the reminder fires; immediately when absent.
    pub process_at: Option<DateTime<Utc>>,
}

pub async fn schedule_appointment_reminder(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleReminderRequest>,
) -> ApiResult<(StatusCode, Json<TaskInfo>)> {
    let task = tasks::appointment_reminder(&request.payload)?;
    let opts = match request.process_at {
        Some(at) => EnqueueOptions::default().process_at(at),
        None => EnqueueOptions::default(),
    };

    let info = state.client.enqueue(task, opts).await?;
    tracing::info!(
        task_id = %info.id,
        appointment_id = %request.payload.appointment_id,
        process_at = %info.process_at,
        "Scheduled appointment reminder"
    );
    Ok((StatusCode::ACCEPTED, Json(info)))
}

pub async fn enqueue_quote_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuoteGeneratePayload>,
) -> ApiResult<(StatusCode, Json<TaskInfo>)> {
    let task = tasks::quote_generate(&payload)?;
    let info = state.client.enqueue(task, EnqueueOptions::default()).await?;
    tracing::info!(task_id = %info.id, job_id = %payload.job_id, "Enqueued quote generation");
    Ok((StatusCode::ACCEPTED, Json(info)))
}
