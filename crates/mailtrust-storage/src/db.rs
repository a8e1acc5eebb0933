//! Database connection and pool management

use mailtrust_common::config::DatabaseConfig;
use mailtrust_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = Self::build_url(config)?;

        info!(
            backend = %config.backend,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build database URL from configuration
    fn build_url(config: &DatabaseConfig) -> Result<String> {
        match config.backend.as_str() {
            "postgres" => config
                .url
                .clone()
                .ok_or_else(|| Error::Config("Database URL required for PostgreSQL".to_string())),
            other => Err(Error::Config(format!(
                "Unsupported database backend: {} (only PostgreSQL is supported)",
                other
            ))),
        }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Map a sqlx error, turning unique-constraint violations into [`Error::Conflict`]
pub(crate) fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return Error::Conflict(db_err.message().to_string());
        }
    }
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_requires_postgres() {
        let config = DatabaseConfig {
            backend: "sqlite".to_string(),
            url: None,
            max_connections: 1,
            min_connections: 1,
        };
        assert!(matches!(DatabasePool::build_url(&config), Err(Error::Config(_))));

        let config = DatabaseConfig {
            backend: "postgres".to_string(),
            url: Some("postgres://localhost/mailtrust".to_string()),
            max_connections: 1,
            min_connections: 1,
        };
        assert_eq!(
            DatabasePool::build_url(&config).unwrap(),
            "postgres://localhost/mailtrust"
        );
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        assert!(matches!(map_db_err(sqlx::Error::RowNotFound), Error::Database(_)));
    }
}
