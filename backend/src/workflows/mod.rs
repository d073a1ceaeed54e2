// Notification Workflows
//
// Tenant-configured workflows decide which automated message a domain event
// sends. Resolution picks the workflow, the executor turns its matching steps
// into outbox rows and delivery sends those rows once they come due.

pub mod repository;
pub mod resolver;
pub mod template;
pub mod recipients;
pub mod executor;
pub mod delivery;

#[cfg(test)]
pub use repository::{MemoryWorkflowRepository, MockWorkflowRepository};
pub use repository::{PgWorkflowRepository, WorkflowError, WorkflowRepository, WorkflowResult};
pub use resolver::{Resolution, ResolveInput, WorkflowResolver};
pub use template::{render, TemplateError};
pub use recipients::resolve_recipients;
pub use executor::{ExecutionReport, NotificationPayload, StepExecutor};
pub use delivery::{DeliveryOutcome, LeadActivity, NotificationDelivery, PgLeadActivity};
