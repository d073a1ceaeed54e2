use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use leadline_shared::Channel;

mod config;
mod database;
mod engine;
mod error;
mod events;
mod handlers;
mod jobs;
mod outbox;
mod queue;
mod services;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};


use engine::{EngineParts, EngineSettings, NotificationEngine};
use jobs::{CleanupConfig, HttpQuoteProcessor, PgAppointmentDirectory, PgJobRetentionStore, QuoteProcessor};
use outbox::{OutboxStore, PgOutboxStore};
use queue::{RedisBroker, ServerConfig};
use services::{EmailSender, NotificationSender, Senders, UnconfiguredSender, WhatsAppSender};
use workflows::{PgLeadActivity, PgWorkflowRepository};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub outbox: Arc<dyn OutboxStore>,
    pub client: queue::Client,
    pub bus: Arc<events::EventBus>,
}

fn build_senders(config: &config::Config) -> anyhow::Result<Senders> {
    let email: Arc<dyn NotificationSender> = if config.smtp.is_configured() {
        Arc::new(EmailSender::new(&config.smtp)?)
    } else {
        tracing::warn!("SMTP is not configured; email notifications will fail");
        Arc::new(UnconfiguredSender::new(Channel::Email))
    };

    let whatsapp: Arc<dyn NotificationSender> = match &config.whatsapp {
        Some(wa) => Arc::new(WhatsAppSender::new(wa.api_url.clone(), wa.api_token.clone())?),
        None => {
            tracing::warn!("WhatsApp is not configured; WhatsApp notifications will fail");
            Arc::new(UnconfiguredSender::new(Channel::WhatsApp))
        }
    };

    Ok(Senders::default()
        .with(Channel::Email, email)
        .with(Channel::WhatsApp, whatsapp))
}

fn engine_settings(config: &config::Config) -> EngineSettings {
    let hours = chrono::Duration::hours;
    EngineSettings {
        max_retry: config.queue.max_retry,
        dispatch_batch_size: config.dispatcher.batch_size,
        dispatch_interval: config.dispatcher.poll_interval,
        server: ServerConfig {
            concurrency: config.queue.concurrency.max(1),
            task_timeout: Duration::from_secs(config.queue.task_timeout_secs.max(1)),
            ..ServerConfig::default()
        },
        cleanup: CleanupConfig {
            interval: config.cleanup.interval,
            completed_retention: hours(config.cleanup.completed_retention_hours),
            failed_retention: hours(config.cleanup.failed_retention_hours),
            outbox_retention: hours(config.cleanup.outbox_retention_hours),
            stale_claim_after: chrono::Duration::minutes(config.cleanup.stale_claim_minutes.max(1)),
        },
        default_country_code: config.default_country_code.clone(),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url, database::PoolConfig::from_env()).await?;

    database::migrate(&db_pool).await?;

    let broker = Arc::new(RedisBroker::connect(&config.redis_url, &config.queue.prefix, &config.queue.name).await?);
    let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(db_pool.clone()));
    let quotes = match &config.quote_service_url {
        Some(url) => {
            let processor: Arc<dyn QuoteProcessor> = Arc::new(HttpQuoteProcessor::new(url.clone())?);
            Some(processor)
        }
        None => None,
    };

    let engine = NotificationEngine::new(
        EngineParts {
            outbox: outbox.clone(),
            workflows: Arc::new(PgWorkflowRepository::new(db_pool.clone())),
            broker,
            senders: build_senders(&config)?,
            activity: Arc::new(PgLeadActivity::new(db_pool.clone())),
            appointments: Arc::new(PgAppointmentDirectory::new(db_pool.clone())),
            quotes,
            retention: Arc::new(PgJobRetentionStore::new(db_pool.clone())),
        },
        engine_settings(&config),
    )
    .await;
    let engine = Arc::new(engine);

    let app_state = Arc::new(AppState {
        db_pool,
        outbox,
        client: engine.client(),
        bus: engine.bus(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Leadline Notification Engine v1.0.0" }))
        .merge(handlers::api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let cancel = CancellationToken::new();
    let engine_task = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    engine_task.await?;

    Ok(())
}
