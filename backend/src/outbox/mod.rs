// Notification Outbox
//
// Durable table of pending notification jobs. The store is the only component
// allowed to change a record's status; dispatcher and workers go through it.

pub mod store;
pub mod postgres;

pub use store::{NewOutboxRecord, OutboxError, OutboxResult, OutboxStore};
pub use postgres::PgOutboxStore;
#[cfg(test)]
pub use memory::MemoryOutboxStore;
