// Queue Server - worker pool, handler routing and redelivery
//
// Every handler error is retried the same way until `max_retry` is spent,
// then the task is dead-lettered. `TaskError::is_permanent` only affects
// logging.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, QueueResult, TaskMessage};
use super::retry::RetryPolicy;
use crate::events::EventError;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Invalid task: {0}")]
    Invalid(String),
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("No handler registered for kind '{0}'")]
    UnknownKind(String),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Whether another attempt can be expected to fail the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Payload(_) | Self::Invalid(_) | Self::UnknownKind(_))
    }
}

impl From<EventError> for TaskError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Invalid(reason) => TaskError::Invalid(reason),
            EventError::Handler(reason) => TaskError::Failed(reason),
        }
    }
}

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub kind: String,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
}

impl TaskContext {
    pub fn is_final_attempt(&self) -> bool {
        self.retried >= self.max_retry
    }
}

impl From<&TaskMessage> for TaskContext {
    fn from(message: &TaskMessage) -> Self {
        Self {
            task_id: message.id.clone(),
            kind: message.kind.clone(),
            queue: message.queue.clone(),
            retried: message.retried,
            max_retry: message.max_retry,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, ctx: &TaskContext, payload: &serde_json::Value) -> Result<(), TaskError>;
}

/// Routes task kinds to their handler.
#[derive(Default)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub concurrency: usize,
    /// Idle sleep when the queue is empty.
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    /// Added to `task_timeout` to form the lease.
    pub lease_grace: Duration,
    pub maintenance_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(500),
            task_timeout: Duration::from_secs(120),
            lease_grace: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Retried { at: chrono::DateTime<Utc> },
    DeadLettered,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

pub struct Server {
    broker: Arc<dyn Broker>,
    mux: Arc<ServeMux>,
    config: ServerConfig,
}

impl Server {
    pub fn new(broker: Arc<dyn Broker>, mux: ServeMux, config: ServerConfig) -> Self {
        Self {
            broker,
            mux: Arc::new(mux),
            config,
        }
    }

    /// Runs the worker pool and the maintenance loop until `cancel` fires.
    /// Workers finish the task in hand before exiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let server = self;
        let mut workers = JoinSet::new();

        for worker_id in 0..server.config.concurrency.max(1) {
            let server = server.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { server.worker_loop(worker_id, cancel).await });
        }

        {
            let server = server.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { server.maintenance_loop(cancel).await });
        }

        info!(
            queue = %server.broker.queue(),
            concurrency = server.config.concurrency,
            "Queue server started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Queue worker exited abnormally: {}", e);
            }
        }
        info!("Queue server stopped");
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        debug!(worker_id, "Worker started");
        while !cancel.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    error!(worker_id, "Failed to process task: {}", e);
                    self.config.poll_interval * 4
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.broker.forward_scheduled(now).await {
                        warn!("Failed to forward scheduled tasks: {}", e);
                    }
                    if let Err(e) = self.broker.recover_expired(now).await {
                        warn!("Failed to recover expired leases: {}", e);
                    }
                }
            }
        }
    }

    async fn invoke(&self, message: &TaskMessage) -> Result<(), TaskError> {
        let handler = self
            .mux
            .get(&message.kind)
            .ok_or_else(|| TaskError::UnknownKind(message.kind.clone()))?;
        let ctx = TaskContext::from(message);
        let timeout = self.config.task_timeout;

        let work = AssertUnwindSafe(handler.process(&ctx, &message.payload)).catch_unwind();
        match tokio::time::timeout(timeout, work).await {
            Err(_) => Err(TaskError::Timeout(timeout)),
            Ok(Err(panic)) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TaskError::Panicked(reason))
            }
            Ok(Ok(result)) => result,
        }
    }

    /// Takes one ready task, runs it and settles it with the broker.
    /// Returns `None` when nothing was ready.
    pub async fn process_next(&self) -> QueueResult<Option<TaskOutcome>> {
        let lease = chrono_duration(self.config.task_timeout + self.config.lease_grace);
        let Some(message) = self.broker.dequeue(Utc::now() + lease).await? else {
            return Ok(None);
        };

        match self.invoke(&message).await {
            Ok(()) => {
                self.broker.ack(&message).await?;
                debug!(task_id = %message.id, kind = %message.kind, "Task completed");
                Ok(Some(TaskOutcome::Completed))
            }
            Err(e) if message.is_final_attempt() => {
                error!(
                    task_id = %message.id,
                    kind = %message.kind,
                    retried = message.retried,
                    "Task exhausted its retries: {}",
                    e
                );
                self.broker.dead_letter(&message, &e.to_string()).await?;
                Ok(Some(TaskOutcome::DeadLettered))
            }
            Err(e) => {
                let at = Utc::now() + chrono_duration(self.config.retry.delay(message.retried));
                let mut next = message.clone();
                next.retried += 1;
                next.last_error = Some(e.to_string());

                warn!(
                    task_id = %message.id,
                    kind = %message.kind,
                    retried = next.retried,
                    permanent = e.is_permanent(),
                    %at,
                    "Task failed, scheduling retry: {}",
                    e
                );
                self.broker.retry(&next, at).await?;
                Ok(Some(TaskOutcome::Retried { at }))
            }
        }
    }
}
