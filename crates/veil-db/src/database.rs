use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use veil_core::AppError;

use crate::config::DatabaseConfig;
use crate::config_repository::ParserConfigRepository;
use crate::proxy_repository::ProxyRepository;

/// How long a caller waits for a pooled connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared PostgreSQL handle for the parser-config and proxy stores.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect without touching the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, AppError> {
        let db = Self::connect(config).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))
    }

    /// Store of per-source parser configuration; hand it to the dispatcher.
    pub fn config_repo(&self) -> ParserConfigRepository {
        ParserConfigRepository::new(self.pool.clone())
    }

    /// Store of workspace proxies; hand it to the proxy pool.
    pub fn proxy_repo(&self) -> ProxyRepository {
        ProxyRepository::new(self.pool.clone())
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), AppError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| AppError::DatabaseError(format!("Database unreachable: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
