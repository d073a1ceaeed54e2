// PostgreSQL outbox store - claims with FOR UPDATE SKIP LOCKED

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadline_shared::{OutboxRecord, OutboxStatus};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{
    allowed_sources, ErrorUpdate, NewOutboxRecord, OutboxError, OutboxResult, OutboxStore, STALE_CLAIM_ERROR,
};

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    tenant_id: Uuid,
    kind: String,
    template: String,
    payload: serde_json::Value,
    run_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxError::Corrupt(format!("{}: {}", row.id, e)))?;

        Ok(OutboxRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            kind: row.kind,
            template: row.template,
            payload: row.payload,
            run_at: row.run_at,
            status,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const OUTBOX_COLUMNS: &str =
    "id, tenant_id, kind, template, payload, run_at, status, attempts, last_error, created_at, updated_at";

async fn insert_row<'e, E>(executor: E, record: &NewOutboxRecord) -> OutboxResult<Uuid>
where
    E: sqlx::PgExecutor<'e>,
{
    let id = Uuid::new_v4();
    let run_at = record.run_at.unwrap_or_else(Utc::now);
    let status = record.status.unwrap_or(OutboxStatus::Pending);

    sqlx::query(
        r#"
        INSERT INTO notification_outbox
        (id, tenant_id, kind, template, payload, run_at, status, attempts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NOW(), NOW())
        "#,
    )
    .bind(id)
    .bind(record.tenant_id)
    .bind(record.kind.trim())
    .bind(record.template.trim())
    .bind(&record.payload)
    .bind(run_at)
    .bind(status.as_str())
    .execute(executor)
    .await?;

    debug!(outbox_id = %id, kind = %record.kind, %run_at, "Inserted outbox record");
    Ok(id)
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        id: Uuid,
        to: OutboxStatus,
        attempt_increment: i32,
        error: ErrorUpdate<'_>,
    ) -> OutboxResult<()> {
        let sources: Vec<String> = allowed_sources(to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let (set_error, error_value) = match error {
            ErrorUpdate::Keep => (false, None),
            ErrorUpdate::Clear => (true, None),
            ErrorUpdate::Set(reason) => (true, Some(reason.to_string())),
        };

        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE notification_outbox
            SET status = $2,
                attempts = attempts + $3,
                last_error = CASE WHEN $4 THEN $5 ELSE last_error END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(attempt_increment)
        .bind(set_error)
        .bind(error_value)
        .bind(&sources)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_some() {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM notification_outbox WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(OutboxError::NotFound(id)),
            Some(status) => {
                let from = status
                    .parse::<OutboxStatus>()
                    .map_err(|e| OutboxError::Corrupt(format!("{}: {}", id, e)))?;
                Err(OutboxError::InvalidTransition { id, from, to })
            }
        }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, record: NewOutboxRecord) -> OutboxResult<Uuid> {
        record.validate()?;
        insert_row(&self.pool, &record).await
    }

    async fn insert_many(&self, records: Vec<NewOutboxRecord>) -> OutboxResult<Vec<Uuid>> {
        for record in &records {
            record.validate()?;
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            ids.push(insert_row(&mut *tx, record).await?);
        }
        tx.commit().await?;

        Ok(ids)
    }

    async fn claim_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM notification_outbox
            WHERE status = 'pending' AND run_at <= NOW()
            ORDER BY run_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        sqlx::query(
            "UPDATE notification_outbox SET status = 'enqueued', updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = OutboxRecord::try_from(row)?;
            record.status = OutboxStatus::Enqueued;
            claimed.push(record);
        }

        info!("Claimed {} outbox records", claimed.len());
        Ok(claimed)
    }

    async fn mark_processing(&self, id: Uuid) -> OutboxResult<()> {
        self.transition(id, OutboxStatus::Processing, 1, ErrorUpdate::Keep).await
    }

    async fn mark_succeeded(&self, id: Uuid) -> OutboxResult<()> {
        self.transition(id, OutboxStatus::Succeeded, 0, ErrorUpdate::Clear).await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> OutboxResult<()> {
        self.transition(id, OutboxStatus::Failed, 0, ErrorUpdate::Set(reason)).await
    }

    async fn mark_pending(&self, id: Uuid, reason: Option<&str>) -> OutboxResult<()> {
        let error = match reason {
            Some(reason) => ErrorUpdate::Set(reason),
            None => ErrorUpdate::Keep,
        };
        self.transition(id, OutboxStatus::Pending, 0, error).await
    }

    async fn record_attempt_error(&self, id: Uuid, reason: &str) -> OutboxResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        match self.get_by_id(id).await? {
            None => Err(OutboxError::NotFound(id)),
            Some(record) => Err(OutboxError::InvalidTransition {
                id,
                from: record.status,
                to: OutboxStatus::Processing,
            }),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> OutboxResult<Option<OutboxRecord>> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRecord::try_from).transpose()
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM notification_outbox
            WHERE status IN ('succeeded', 'failed') AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'pending', last_error = $2, updated_at = NOW()
            WHERE status = 'enqueued' AND updated_at < $1
            "#,
        )
        .bind(before)
        .bind(STALE_CLAIM_ERROR)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!("Released {} stale outbox claims", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}
