// Cleanup Job - purges finished quote generation jobs and outbox rows, and
// releases outbox claims that never reached the queue

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use leadline_shared::QuoteJobStatus;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::outbox::{OutboxError, OutboxStore};

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("Invalid status for cleanup: {0}")]
    InvalidStatus(QuoteJobStatus),
}

pub type CleanupResult<T> = Result<T, CleanupError>;

/// Deletes terminal quote generation jobs.
#[async_trait]
pub trait JobRetentionStore: Send + Sync {
    /// Removes jobs in `status` that finished before `before`.
    async fn delete_finished(&self, status: QuoteJobStatus, before: DateTime<Utc>) -> CleanupResult<u64>;
}

fn require_terminal(status: QuoteJobStatus) -> CleanupResult<()> {
    match status {
        QuoteJobStatus::Completed | QuoteJobStatus::Failed => Ok(()),
        other => Err(CleanupError::InvalidStatus(other)),
    }
}

#[derive(Clone)]
pub struct PgJobRetentionStore {
    pool: PgPool,
}

impl PgJobRetentionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRetentionStore for PgJobRetentionStore {
    async fn delete_finished(&self, status: QuoteJobStatus, before: DateTime<Utc>) -> CleanupResult<u64> {
        require_terminal(status)?;

        let result = sqlx::query(
            r#"
            DELETE FROM quote_generation_jobs
            WHERE status = $1 AND COALESCE(finished_at, updated_at) < $2
            "#,
        )
        .bind(status.as_str())
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub use memory::{MemoryJobRetentionStore, QuoteJobEntry};


#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub completed_retention: ChronoDuration,
    pub failed_retention: ChronoDuration,
    pub outbox_retention: ChronoDuration,
    /// How long a row may stay `enqueued` before it is claimable again.
    pub stale_claim_after: ChronoDuration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            completed_retention: ChronoDuration::days(7),
            failed_retention: ChronoDuration::days(30),
            outbox_retention: ChronoDuration::days(30),
            stale_claim_after: ChronoDuration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub outbox_rows: u64,
    pub released_claims: u64,
    /// Sweeps that errored this round.
    pub failures: usize,
}

fn settle<E: std::fmt::Display>(sweep: &str, result: Result<u64, E>, failures: &mut usize) -> u64 {
    match result {
        Ok(count) => count,
        Err(e) => {
            error!(sweep, "Cleanup sweep failed: {}", e);
            *failures += 1;
            0
        }
    }
}

pub struct CleanupJob {
    jobs: Arc<dyn JobRetentionStore>,
    outbox: Arc<dyn OutboxStore>,
    config: CleanupConfig,
}

impl CleanupJob {
    pub fn new(jobs: Arc<dyn JobRetentionStore>, outbox: Arc<dyn OutboxStore>, config: CleanupConfig) -> Self {
        Self { jobs, outbox, config }
    }

    /// Runs every sweep once. A failing sweep is logged and does not stop
    /// the others.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let config = &self.config;
        let completed = self
            .jobs
            .delete_finished(QuoteJobStatus::Completed, now - config.completed_retention)
            .await;
        let failed = self
            .jobs
            .delete_finished(QuoteJobStatus::Failed, now - config.failed_retention)
            .await;
        let purged = self.outbox.purge_finished(now - config.outbox_retention).await;
        let released = self.outbox.release_stale_claims(now - config.stale_claim_after).await;

        let mut failures = 0;
        let report = CleanupReport {
            completed_jobs: settle("completed quote jobs", completed, &mut failures),
            failed_jobs: settle("failed quote jobs", failed, &mut failures),
            outbox_rows: settle("finished outbox rows", purged, &mut failures),
            released_claims: settle("stale outbox claims", released, &mut failures),
            failures,
        };

        info!(
            completed_jobs = report.completed_jobs,
            failed_jobs = report.failed_jobs,
            outbox_rows = report.outbox_rows,
            released_claims = report.released_claims,
            failures = report.failures,
            "Cleanup finished"
        );
        report
    }

    /// Sweeps once immediately, then on every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_once(Utc::now()).await;
                }
            }
        }
        info!("Cleanup loop stopped");
    }
}
