// Redis broker
//
// Keys live under `{prefix}:{queue}`:
//   :scheduled  ZSET  task ids scored by unix ms due time (future tasks, retries)
//   :pending    LIST  ready task ids, LPUSH in, RPOPLPUSH out
//   :active     LIST  task ids being processed
//   :lease      ZSET  active task ids scored by lease deadline
//   :dead       LIST  dead letter JSON, newest first, capped
//   :task:{id}  STRING task message JSON

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::broker::{Broker, DeadLetter, QueueResult, TaskInfo, TaskMessage, TaskState};

const MAX_DEAD_LETTERS: isize = 10_000;
const MOVE_BATCH: usize = 100;

const DEQUEUE_SCRIPT: &str = r#"
for _ = 1, 10 do
    local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
    if not id then
        return false
    end
    local msg = redis.call('GET', ARGV[2] .. id)
    if msg then
        redis.call('ZADD', KEYS[3], ARGV[1], id)
        return msg
    end
    redis.call('LREM', KEYS[2], 1, id)
end
return false
"#;

const FORWARD_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

const RECOVER_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LREM', KEYS[2], 1, id)
    redis.call('ZADD', KEYS[3], ARGV[1], id)
end
return #ids
"#;

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[derive(Clone)]
struct Keys {
    scheduled: String,
    pending: String,
    active: String,
    lease: String,
    dead: String,
    task_prefix: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            scheduled: format!("{}:scheduled", base),
            pending: format!("{}:pending", base),
            active: format!("{}:active", base),
            lease: format!("{}:lease", base),
            dead: format!("{}:dead", base),
            task_prefix: format!("{}:task:", base),
        }
    }

    fn task(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix, id)
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    queue: String,
    keys: Keys,
    dequeue_script: Script,
    forward_script: Script,
    recover_script: Script,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, prefix: &str, queue: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix, queue))
    }

    pub fn new(conn: ConnectionManager, prefix: &str, queue: &str) -> Self {
        Self {
            conn,
            queue: queue.to_string(),
            keys: Keys::new(prefix, queue),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            forward_script: Script::new(FORWARD_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn enqueue(&self, message: TaskMessage, process_at: DateTime<Utc>) -> QueueResult<TaskInfo> {
        let json = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();
        let ready = process_at <= Utc::now();

        let mut pipe = redis::pipe();
        pipe.atomic().set(self.keys.task(&message.id), json).ignore();
        if ready {
            pipe.lpush(&self.keys.pending, &message.id).ignore();
        } else {
            pipe.zadd(&self.keys.scheduled, &message.id, score(process_at)).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(task_id = %message.id, kind = %message.kind, %process_at, "Enqueued task");
        Ok(TaskInfo {
            id: message.id,
            kind: message.kind,
            queue: self.queue.clone(),
            state: if ready { TaskState::Pending } else { TaskState::Scheduled },
            process_at,
        })
    }

    async fn dequeue(&self, lease_until: DateTime<Utc>) -> QueueResult<Option<TaskMessage>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .dequeue_script
            .key(&self.keys.pending)
            .key(&self.keys.active)
            .key(&self.keys.lease)
            .arg(score(lease_until))
            .arg(&self.keys.task_prefix)
            .invoke_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, message: &TaskMessage) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.keys.active, 1, &message.id)
            .ignore()
            .zrem(&self.keys.lease, &message.id)
            .ignore()
            .del(self.keys.task(&message.id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, message: &TaskMessage, at: DateTime<Utc>) -> QueueResult<()> {
        let json = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.keys.active, 1, &message.id)
            .ignore()
            .zrem(&self.keys.lease, &message.id)
            .ignore()
            .set(self.keys.task(&message.id), json)
            .ignore()
            .zadd(&self.keys.scheduled, &message.id, score(at))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, message: &TaskMessage, error: &str) -> QueueResult<()> {
        let letter = DeadLetter {
            message: message.clone(),
            error: error.to_string(),
            died_at: Utc::now(),
        };
        let json = serde_json::to_string(&letter)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.keys.active, 1, &message.id)
            .ignore()
            .zrem(&self.keys.lease, &message.id)
            .ignore()
            .del(self.keys.task(&message.id))
            .ignore()
            .lpush(&self.keys.dead, json)
            .ignore()
            .ltrim(&self.keys.dead, 0, MAX_DEAD_LETTERS - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        warn!(task_id = %message.id, kind = %message.kind, "Task dead-lettered: {}", error);
        Ok(())
    }

    async fn forward_scheduled(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let moved: u64 = self
            .forward_script
            .key(&self.keys.scheduled)
            .key(&self.keys.pending)
            .arg(score(now))
            .arg(MOVE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let moved: u64 = self
            .recover_script
            .key(&self.keys.lease)
            .key(&self.keys.active)
            .key(&self.keys.scheduled)
            .arg(score(now))
            .arg(MOVE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            warn!("Recovered {} tasks with expired leases", moved);
        }
        Ok(moved)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.keys.dead, 0, limit as isize - 1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(Into::into))
            .collect()
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
