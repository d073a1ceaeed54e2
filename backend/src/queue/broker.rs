// Job Queue Broker - durable task storage with leases and dead letters

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A unit of work as submitted by a producer.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new<P: Serialize>(kind: impl Into<String>, payload: &P) -> QueueResult<Self> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(QueueError::InvalidTask("kind is required".to_string()));
        }
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// A task as the broker stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub queue: String,
    /// Redeliveries so far; zero on the first attempt.
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task: Task, queue: impl Into<String>, max_retry: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: task.kind,
            payload: task.payload,
            queue: queue.into(),
            retried: 0,
            max_retry,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.retried >= self.max_retry
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Defaults to immediately.
    pub process_at: Option<DateTime<Utc>>,
    /// Defaults to the client's configured maximum.
    pub max_retry: Option<u32>,
}

impl EnqueueOptions {
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub kind: String,
    pub queue: String,
    pub state: TaskState,
    pub process_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub error: String,
    pub died_at: DateTime<Utc>,
}

/// Storage seam of the queue. Every method is atomic with respect to other
/// brokers sharing the same backing store.
#[async_trait]
pub trait Broker: Send + Sync {
    fn queue(&self) -> &str;

    /// Stores the message as pending when `process_at` has passed, as
    /// scheduled otherwise.
    async fn enqueue(&self, message: TaskMessage, process_at: DateTime<Utc>) -> QueueResult<TaskInfo>;

    /// Moves the oldest pending task to active, leased until `lease_until`.
    async fn dequeue(&self, lease_until: DateTime<Utc>) -> QueueResult<Option<TaskMessage>>;

    /// Drops a finished task.
    async fn ack(&self, message: &TaskMessage) -> QueueResult<()>;

    /// Reschedules an active task. `message` carries the bumped retry count.
    async fn retry(&self, message: &TaskMessage, at: DateTime<Utc>) -> QueueResult<()>;

    async fn dead_letter(&self, message: &TaskMessage, error: &str) -> QueueResult<()>;

    /// Promotes due scheduled tasks to pending. Returns how many moved.
    async fn forward_scheduled(&self, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Reschedules active tasks whose lease ran out. Returns how many moved.
    async fn recover_expired(&self, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>>;

    async fn ping(&self) -> QueueResult<()>;
}
