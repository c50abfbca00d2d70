//! PostgreSQL pool for the `postgres` backend
//!
//! The `memory` backend keeps campaigns in [`crate::MemoryStore`] and never
//! opens a pool, so [`DatabasePool::connect`] hands back `None` for it.

use chatdesk_common::config::DatabaseConfig;
use chatdesk_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Backend value that selects the in-process store
pub const MEMORY_BACKEND: &str = "memory";
/// Backend value that selects PostgreSQL
pub const POSTGRES_BACKEND: &str = "postgres";

/// Connection pool shared by the PostgreSQL repositories
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Open a pool when the configured backend is PostgreSQL.
    ///
    /// Returns `Ok(None)` for the memory backend.
    pub async fn connect(config: &DatabaseConfig) -> Result<Option<Self>> {
        let Some(url) = postgres_url(config)? else {
            info!("Memory backend selected; no database pool opened");
            return Ok(None);
        };

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        Ok(Some(Self { pool }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded blast schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        Ok(())
    }

    /// Round-trip a trivial query; backs the readiness probe
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Connection URL for the postgres backend, `None` for the memory backend
fn postgres_url(config: &DatabaseConfig) -> Result<Option<String>> {
    match config.backend.as_str() {
        MEMORY_BACKEND => Ok(None),
        POSTGRES_BACKEND => config.url.clone().map(Some).ok_or_else(|| {
            Error::Config("database.url is required when database.backend = \"postgres\"".to_string())
        }),
        other => Err(Error::Config(format!(
            "Unsupported database backend '{}'; expected \"{}\" or \"{}\"",
            other, POSTGRES_BACKEND, MEMORY_BACKEND
        ))),
    }
}
