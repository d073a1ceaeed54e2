// Background Jobs
//
// The outbox dispatcher and cleanup loops, plus the handlers the queue
// server routes tasks to.

pub mod cleanup;
pub mod dispatcher;
pub mod handlers;
pub mod tasks;

pub use cleanup::{CleanupConfig, CleanupError, CleanupJob, CleanupReport, CleanupResult, JobRetentionStore, PgJobRetentionStore};
#[cfg(test)]
pub use cleanup::{MemoryJobRetentionStore, QuoteJobEntry};
pub use dispatcher::{DispatchReport, OutboxDispatcher};
pub use handlers::{
    AppointmentDirectory, AppointmentReminderHandler, HttpQuoteProcessor, OutboxDueHandler, PgAppointmentDirectory,
    QuoteGenerationHandler, QuoteProcessor, ReminderContext,
};
