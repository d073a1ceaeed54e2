// In-memory broker with the same semantics as the Redis broker

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::broker::{Broker, DeadLetter, QueueResult, TaskInfo, TaskMessage, TaskState};

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, TaskMessage>,
    scheduled: HashMap<String, DateTime<Utc>>,
    pending: VecDeque<String>,
    /// Active task ids with their lease deadline.
    active: HashMap<String, DateTime<Utc>>,
    dead: VecDeque<DeadLetter>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    queue: String,
    state: Arc<Mutex<QueueState>>,
}

impl MemoryBroker {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn active_len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Scheduled messages with their due time, earliest first.
    pub async fn scheduled(&self) -> Vec<(TaskMessage, DateTime<Utc>)> {
        let state = self.state.lock().await;
        let mut scheduled: Vec<(TaskMessage, DateTime<Utc>)> = state
            .scheduled
            .iter()
            .filter_map(|(id, at)| state.tasks.get(id).map(|m| (m.clone(), *at)))
            .collect();
        scheduled.sort_by_key(|(_, at)| *at);
        scheduled
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, message: TaskMessage, process_at: DateTime<Utc>) -> QueueResult<TaskInfo> {
        let ready = process_at <= Utc::now();
        let info = TaskInfo {
            id: message.id.clone(),
            kind: message.kind.clone(),
            queue: self.queue.clone(),
            state: if ready { TaskState::Pending } else { TaskState::Scheduled },
            process_at,
        };

        let mut state = self.state.lock().await;
        if ready {
            state.pending.push_back(message.id.clone());
        } else {
            state.scheduled.insert(message.id.clone(), process_at);
        }
        state.tasks.insert(message.id.clone(), message);
        Ok(info)
    }

    async fn dequeue(&self, lease_until: DateTime<Utc>) -> QueueResult<Option<TaskMessage>> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.pending.pop_front() {
            if let Some(message) = state.tasks.get(&id).cloned() {
                state.active.insert(id, lease_until);
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn ack(&self, message: &TaskMessage) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.active.remove(&message.id);
        state.tasks.remove(&message.id);
        Ok(())
    }

    async fn retry(&self, message: &TaskMessage, at: DateTime<Utc>) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.active.remove(&message.id);
        state.tasks.insert(message.id.clone(), message.clone());
        state.scheduled.insert(message.id.clone(), at);
        Ok(())
    }

    async fn dead_letter(&self, message: &TaskMessage, error: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.active.remove(&message.id);
        state.tasks.remove(&message.id);
        state.dead.push_front(DeadLetter {
            message: message.clone(),
            error: error.to_string(),
            died_at: Utc::now(),
        });
        Ok(())
    }

    async fn forward_scheduled(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let mut due: Vec<(DateTime<Utc>, String)> = state
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*at, id.clone()))
            .collect();
        due.sort();

        for (_, id) in &due {
            state.scheduled.remove(id);
            state.pending.push_back(id.clone());
        }
        Ok(due.len() as u64)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| **lease <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.active.remove(id);
            state.scheduled.insert(id.clone(), now);
        }
        Ok(expired.len() as u64)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::broker::Task;
    use chrono::Duration;
    use serde_json::json;

    fn message() -> TaskMessage {
        let task = Task::new("outbox.due", &json!({"outboxId": "x"})).unwrap();
        TaskMessage::new(task, "notifications", 3)
    }

    #[tokio::test]
    async fn future_tasks_wait_until_forwarded() {
        let broker = MemoryBroker::new("notifications");
        let at = Utc::now() + Duration::minutes(5);
        let info = broker.enqueue(message(), at).await.unwrap();
        assert_eq!(info.state, TaskState::Scheduled);

        assert!(broker.dequeue(Utc::now()).await.unwrap().is_none());
        assert_eq!(broker.forward_scheduled(Utc::now()).await.unwrap(), 0);
        assert_eq!(broker.forward_scheduled(at).await.unwrap(), 1);
        assert!(broker.dequeue(Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered() {
        let broker = MemoryBroker::new("notifications");
        let original = message();
        broker.enqueue(original.clone(), Utc::now()).await.unwrap();

        let lease = Utc::now() + Duration::seconds(30);
        let leased = broker.dequeue(lease).await.unwrap().unwrap();
        assert_eq!(leased.id, original.id);
        assert_eq!(broker.recover_expired(Utc::now()).await.unwrap(), 0);

        let after_lease = lease + Duration::seconds(1);
        assert_eq!(broker.recover_expired(after_lease).await.unwrap(), 1);
        broker.forward_scheduled(after_lease).await.unwrap();
        let again = broker.dequeue(after_lease + Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(again.id, original.id);
        assert_eq!(again.retried, 0);
    }
}
