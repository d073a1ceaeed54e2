use chrono::Utc;
use std::sync::Arc;

use super::broker::{Broker, DeadLetter, EnqueueOptions, QueueResult, Task, TaskInfo, TaskMessage};

/// Producer side of the queue.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    default_max_retry: u32,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>, default_max_retry: u32) -> Self {
        Self { broker, default_max_retry }
    }

    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> QueueResult<TaskInfo> {
        let max_retry = opts.max_retry.unwrap_or(self.default_max_retry);
        let message = TaskMessage::new(task, self.broker.queue(), max_retry);
        let process_at = opts.process_at.unwrap_or_else(Utc::now);
        self.broker.enqueue(message, process_at).await
    }

    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        self.broker.dead_letters(limit).await
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.broker.ping().await
    }
}
