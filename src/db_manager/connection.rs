use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::{MySql, MySqlPool, Pool};

/// Manages the engine's database connection.
pub struct ConnectionManager {
    /// Base URL for database connections
    base_url: String,

    /// Main engine database pool
    main_pool: Pool<MySql>,
}

impl ConnectionManager {
    /// Creates a new connection manager
    pub async fn new(base_url: &str) -> Result<Self, DatabaseError> {
        // Connect to the MySQL server without specifying a database
        info!("Connecting to MySQL server at {}", base_url);
        let server_pool = MySqlPool::connect(base_url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // Ensure the engine database exists
        Self::ensure_database_exists(&server_pool, "vmvault").await?;

        // Connect to the engine database
        let main_db_url = format!("{}/vmvault", base_url);
        info!("Connecting to engine database at {}", main_db_url);
        let main_pool = MySqlPool::connect(&main_db_url)
            .await
            .map_err(|e| {
                DatabaseError::ConnectionError(format!(
                    "Failed to connect to engine database: {}",
                    e
                ))
            })?;

        info!("✓ Database connection established");

        Ok(Self {
            base_url: base_url.to_string(),
            main_pool,
        })
    }

    /// Ensures a database exists, creating it if necessary
    pub async fn ensure_database_exists(
        pool: &Pool<MySql>,
        db_name: &str,
    ) -> Result<(), DatabaseError> {
        info!("Ensuring database exists: {}", db_name);
        let query = format!("CREATE DATABASE IF NOT EXISTS `{}`", db_name);
        sqlx::query(&query)
            .execute(pool)
            .await
            .map_err(DatabaseError::SqlxError)?;

        info!("✓ Database {} exists or was created", db_name);
        Ok(())
    }

    /// Gets the engine database pool
    pub fn main_pool(&self) -> &Pool<MySql> {
        &self.main_pool
    }

    /// Gets the base server URL this manager connected with
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
