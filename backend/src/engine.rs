// Notification Engine - wires stores, bus, queue and loops together

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventBus, EventKind};
use crate::jobs::{
    tasks, AppointmentDirectory, AppointmentReminderHandler, CleanupConfig, CleanupJob, JobRetentionStore,
    OutboxDispatcher, OutboxDueHandler, QuoteGenerationHandler, QuoteProcessor,
};
use crate::outbox::OutboxStore;
use crate::queue::{Broker, Client, ServeMux, Server, ServerConfig};
use crate::services::Senders;
use crate::workflows::{LeadActivity, NotificationDelivery, StepExecutor, WorkflowRepository, WorkflowResolver};

/// Collaborators the engine runs on.
pub struct EngineParts {
    pub outbox: Arc<dyn OutboxStore>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub broker: Arc<dyn Broker>,
    pub senders: Senders,
    pub activity: Arc<dyn LeadActivity>,
    pub appointments: Arc<dyn AppointmentDirectory>,
    pub quotes: Option<Arc<dyn QuoteProcessor>>,
    pub retention: Arc<dyn JobRetentionStore>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retry: u32,
    pub dispatch_batch_size: i64,
    pub dispatch_interval: Duration,
    pub server: ServerConfig,
    pub cleanup: CleanupConfig,
    pub default_country_code: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retry: 10,
            dispatch_batch_size: 50,
            dispatch_interval: Duration::from_secs(2),
            server: ServerConfig::default(),
            cleanup: CleanupConfig::default(),
            default_country_code: None,
        }
    }
}

pub struct NotificationEngine {
    bus: Arc<EventBus>,
    client: Client,
    dispatcher: Arc<OutboxDispatcher>,
    server: Arc<Server>,
    cleanup: Arc<CleanupJob>,
}

impl NotificationEngine {
    pub async fn new(parts: EngineParts, settings: EngineSettings) -> Self {
        let bus = Arc::new(EventBus::new());

        let executor = Arc::new(
            StepExecutor::new(WorkflowResolver::new(parts.workflows.clone()), parts.outbox.clone())
                .with_default_country_code(settings.default_country_code.clone()),
        );
        for kind in EventKind::TRIGGERS {
            bus.subscribe(kind, executor.clone()).await;
        }

        let delivery = Arc::new(NotificationDelivery::new(
            parts.outbox.clone(),
            parts.senders,
            parts.activity,
        ));
        bus.subscribe(EventKind::NotificationOutboxDue, delivery).await;

        let mut mux = ServeMux::new()
            .handle(tasks::OUTBOX_DUE, Arc::new(OutboxDueHandler::new(bus.clone())))
            .handle(
                tasks::APPOINTMENT_REMINDER,
                Arc::new(AppointmentReminderHandler::new(parts.appointments, bus.clone())),
            );
        match parts.quotes {
            Some(processor) => mux = mux.handle(tasks::QUOTE_GENERATE, Arc::new(QuoteGenerationHandler::new(processor))),
            None => warn!("No quote processor configured; {} tasks will not be handled", tasks::QUOTE_GENERATE),
        }

        let client = Client::new(parts.broker.clone(), settings.max_retry);
        let dispatcher = Arc::new(OutboxDispatcher::new(
            parts.outbox.clone(),
            client.clone(),
            settings.dispatch_batch_size,
            settings.dispatch_interval,
        ));
        let server = Arc::new(Server::new(parts.broker, mux, settings.server));
        let cleanup = Arc::new(CleanupJob::new(parts.retention, parts.outbox.clone(), settings.cleanup));

        Self {
            bus,
            client,
            dispatcher,
            server,
            cleanup,
        }
    }

    /// Where producers publish domain events.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    #[cfg(test)]
    pub fn dispatcher(&self) -> &OutboxDispatcher {
        &self.dispatcher
    }

    #[cfg(test)]
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Runs the dispatcher, the queue server and the cleanup loop until
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let dispatcher = {
            let dispatcher = self.dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };
        let server = tokio::spawn(self.server.clone().run(cancel.clone()));
        let cleanup = {
            let cleanup = self.cleanup.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cleanup.run(cancel).await })
        };

        info!("Notification engine running");
        let (dispatcher, server, cleanup) = tokio::join!(dispatcher, server, cleanup);
        for (name, result) in [("dispatcher", dispatcher), ("queue server", server), ("cleanup", cleanup)] {
            if let Err(e) = result {
                error!("Engine {} task failed: {}", name, e);
            }
        }
        info!("Notification engine stopped");
    }
}
