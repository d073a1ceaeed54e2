// Job Queue
//
// At-least-once task execution on Redis (asynq-style key layout), with an
// in-memory broker for tests.

pub mod broker;
pub mod client;
#[cfg(test)]
pub mod memory;
pub mod redis_broker;
pub mod retry;
pub mod server;

pub use broker::{Broker, DeadLetter, EnqueueOptions, QueueError, QueueResult, Task, TaskInfo, TaskMessage, TaskState};
pub use client::Client;
#[cfg(test)]
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use retry::RetryPolicy;
pub use server::{ServeMux, Server, ServerConfig, TaskContext, TaskError, TaskHandler, TaskOutcome};
