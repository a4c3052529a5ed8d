use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::DatabaseConfig;

/// Errors from the storage layer
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Write attempted in read-only transaction")]
    ReadOnly,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Process-wide connection pool for the hierarchy database
pub struct DatabaseManager {
    pool: OnceCell<PgPool>,
}

impl DatabaseManager {
    fn instance() -> &'static DatabaseManager {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<DatabaseManager> = OnceLock::new();
        INSTANCE.get_or_init(|| DatabaseManager { pool: OnceCell::new() })
    }

    /// Get the shared pool, connecting lazily on first use
    pub async fn pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        let pool = Self::instance()
            .pool
            .get_or_try_init(|| Self::connect(config))
            .await?;
        Ok(pool.clone())
    }

    /// Open a fresh pool from configuration (bypasses the shared instance)
    pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        let url = config
            .url
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_URL"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(url)
            .await?;

        info!("Created database pool (max_connections={})", config.max_connections);
        Ok(pool)
    }

    /// Pings the shared pool to ensure connectivity
    pub async fn health_check(config: &DatabaseConfig) -> Result<(), DatabaseError> {
        let pool = Self::pool(config).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Close the shared pool (e.g., on shutdown)
    pub async fn close() {
        if let Some(pool) = Self::instance().pool.get() {
            pool.close().await;
            info!("Closed database pool");
        }
    }

    /// Quote SQL identifier to prevent injection
    pub fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Validate shadow table names. Accepts lowercase ASCII letters, digits
    /// and underscores, starting with a letter, at most 63 bytes.
    pub fn is_valid_table_name(name: &str) -> bool {
        if name.is_empty() || name.len() > 63 {
            return false;
        }
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}
