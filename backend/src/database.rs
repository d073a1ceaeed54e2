use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            // Dispatchers, workers and cleanup share one pool
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PoolConfig {
    /// Create config from `DB_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: Duration::from_secs(env_or("DB_ACQUIRE_TIMEOUT", defaults.acquire_timeout.as_secs())),
            idle_timeout: Duration::from_secs(env_or("DB_IDLE_TIMEOUT", defaults.idle_timeout.as_secs())),
            max_lifetime: Duration::from_secs(env_or("DB_MAX_LIFETIME", defaults.max_lifetime.as_secs())),
        }
    }
}

pub async fn create_pool(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        tracing::info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: max={}, min={}",
        config.max_connections,
        config.min_connections
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
