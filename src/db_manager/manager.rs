use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;
use sqlx::{MySql, Pool};

/// Central manager for all database operations
pub struct DatabaseManager {
    /// Connection manager for the engine pool
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    /// Creates a new database manager
    pub async fn new(connection_url: &str) -> Result<Self, DatabaseError> {
        // Create connection manager
        let connection_manager = ConnectionManager::new(connection_url).await?;

        // Create the manager
        let manager = Self { connection_manager };

        // Initialize the engine schema
        manager.initialize_schema().await?;

        Ok(manager)
    }

    /// Initializes the engine database schema
    pub async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        MigrationManager::initialize_schema(self).await
    }

    /// Gets the engine database pool
    pub fn get_pool(&self) -> &Pool<MySql> {
        self.connection_manager.main_pool()
    }
}
