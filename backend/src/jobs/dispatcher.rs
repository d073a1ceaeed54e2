// Outbox Dispatcher - moves due outbox rows onto the job queue

use leadline_shared::OutboxRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::tasks::{self, OutboxDuePayload};
use crate::outbox::{OutboxResult, OutboxStore};
use crate::queue::{Client, EnqueueOptions, QueueResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub enqueued: usize,
    pub reverted: usize,
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    client: Client,
    batch_size: i64,
    interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(outbox: Arc<dyn OutboxStore>, client: Client, batch_size: i64, interval: Duration) -> Self {
        Self {
            outbox,
            client,
            batch_size,
            interval,
        }
    }

    async fn enqueue(&self, record: &OutboxRecord) -> QueueResult<()> {
        let lead_id = record
            .payload
            .get("lead_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        let task = tasks::outbox_due(&OutboxDuePayload {
            outbox_id: record.id,
            tenant_id: record.tenant_id,
            lead_id,
        })?;
        let info = self
            .client
            .enqueue(task, EnqueueOptions::default().process_at(record.run_at))
            .await?;
        debug!(outbox_id = %record.id, task_id = %info.id, "Outbox row enqueued");
        Ok(())
    }

    /// Claims one batch and enqueues a delivery task per row. Rows that
    /// could not be enqueued are reverted to pending.
    pub async fn poll_once(&self) -> OutboxResult<DispatchReport> {
        let claimed = self.outbox.claim_pending(self.batch_size).await?;
        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for record in &claimed {
            match self.enqueue(record).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    warn!(outbox_id = %record.id, "Failed to enqueue outbox row: {}", e);
                    let reason = format!("enqueue failed: {}", e);
                    if let Err(revert_err) = self.outbox.mark_pending(record.id, Some(&reason)).await {
                        error!(outbox_id = %record.id, "Failed to revert outbox row: {}", revert_err);
                    } else {
                        report.reverted += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                enqueued = report.enqueued,
                reverted = report.reverted,
                "Dispatched outbox batch"
            );
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Outbox dispatcher started (every {:?}, batch {})", self.interval, self.batch_size);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Outbox dispatch failed: {}", e);
                    }
                }
            }
        }
        info!("Outbox dispatcher stopped");
    }
}
