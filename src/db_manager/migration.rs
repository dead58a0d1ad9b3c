use crate::db_manager;
use crate::db_manager::error::DatabaseError;
use colored::Colorize;
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::env;

/// Manages database schema migrations
pub struct MigrationManager;

/// DDL for the engine schema, one statement per entry, executed in order.
///
/// Foreign keys: backup_job.parent_backup_id → backup_job.id (nullable),
/// backup_job.context_id → vm_context.id (cascade delete),
/// backup_chain.{full,latest}_backup_id → backup_job.id,
/// log_event.job_id → job.id. backup_chain is unique per
/// (context_id, disk_ordinal, repository_id).
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS vm_context (
        id VARCHAR(64) PRIMARY KEY,
        display_name VARCHAR(255) NOT NULL,
        platform VARCHAR(32) NOT NULL,
        disk_inventory JSON,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS disk (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        context_id VARCHAR(64) NOT NULL,
        disk_ordinal INT NOT NULL,
        capacity_bytes BIGINT NOT NULL,
        allocated_bytes BIGINT,
        change_marker TEXT,
        UNIQUE KEY uq_disk (context_id, disk_ordinal),
        CONSTRAINT fk_disk_context FOREIGN KEY (context_id)
            REFERENCES vm_context (id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS repository (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        kind VARCHAR(32) NOT NULL,
        config JSON NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        immutable BOOLEAN NOT NULL DEFAULT FALSE,
        retention_days INT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        used_bytes BIGINT NOT NULL DEFAULT 0,
        available_bytes BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_job (
        id VARCHAR(36) PRIMARY KEY,
        context_id VARCHAR(64) NOT NULL,
        disk_ordinal INT NOT NULL,
        backup_type VARCHAR(16) NOT NULL,
        status VARCHAR(16) NOT NULL,
        repository_id VARCHAR(64) NOT NULL,
        image_path TEXT,
        parent_backup_id VARCHAR(36),
        change_marker TEXT,
        bytes_transferred BIGINT NOT NULL DEFAULT 0,
        total_bytes BIGINT,
        error_message TEXT,
        retention_until TIMESTAMP NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        started_at TIMESTAMP NULL,
        completed_at TIMESTAMP NULL,
        KEY idx_backup_disk (context_id, disk_ordinal),
        KEY idx_backup_repo (repository_id),
        KEY idx_backup_status (status),
        CONSTRAINT fk_backup_context FOREIGN KEY (context_id)
            REFERENCES vm_context (id) ON DELETE CASCADE,
        CONSTRAINT fk_backup_parent FOREIGN KEY (parent_backup_id)
            REFERENCES backup_job (id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_chain (
        id VARCHAR(64) PRIMARY KEY,
        context_id VARCHAR(64) NOT NULL,
        disk_ordinal INT NOT NULL,
        repository_id VARCHAR(64) NOT NULL,
        full_backup_id VARCHAR(36) NOT NULL,
        latest_backup_id VARCHAR(36) NOT NULL,
        backup_count INT NOT NULL DEFAULT 1,
        total_size_bytes BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            ON UPDATE CURRENT_TIMESTAMP,
        UNIQUE KEY uq_chain (context_id, disk_ordinal, repository_id),
        CONSTRAINT fk_chain_full FOREIGN KEY (full_backup_id)
            REFERENCES backup_job (id),
        CONSTRAINT fk_chain_latest FOREIGN KEY (latest_backup_id)
            REFERENCES backup_job (id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS job (
        id VARCHAR(36) PRIMARY KEY,
        parent_id VARCHAR(36),
        kind VARCHAR(64) NOT NULL,
        owner VARCHAR(64) NOT NULL,
        external_id VARCHAR(64),
        status VARCHAR(16) NOT NULL,
        error TEXT,
        created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        completed_at TIMESTAMP(6) NULL,
        KEY idx_job_external (external_id),
        CONSTRAINT fk_job_parent FOREIGN KEY (parent_id) REFERENCES job (id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS job_step (
        id VARCHAR(36) PRIMARY KEY,
        job_id VARCHAR(36) NOT NULL,
        name VARCHAR(128) NOT NULL,
        status VARCHAR(16) NOT NULL,
        error TEXT,
        started_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        completed_at TIMESTAMP(6) NULL,
        CONSTRAINT fk_step_job FOREIGN KEY (job_id) REFERENCES job (id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS log_event (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        job_id VARCHAR(36) NOT NULL,
        step_id VARCHAR(36),
        seq BIGINT NOT NULL,
        level VARCHAR(8) NOT NULL,
        message TEXT NOT NULL,
        attrs JSON,
        recorded_at TIMESTAMP(6) NOT NULL,
        KEY idx_event_job (job_id, seq),
        CONSTRAINT fk_event_job FOREIGN KEY (job_id) REFERENCES job (id)
    )"#,
];

impl MigrationManager {
    /// Initializes and migrates the engine database schema
    pub async fn initialize_schema(
        db_manager: &db_manager::DatabaseManager,
    ) -> Result<(), DatabaseError> {
        info!("Initializing engine database schema...");

        let pool = db_manager.get_pool();

        Self::initialize_metadata_system(pool).await?;

        let target_version = Self::get_target_schema_version()?;
        let current_version = Self::get_current_schema_version(pool).await?;

        if current_version == target_version {
            info!("Schema version check: OK (version {})", current_version);
            return Ok(());
        }

        Self::migrate_schema(pool, current_version, target_version).await
    }

    /// Gets the target schema version from environment or defaults to 1
    fn get_target_schema_version() -> Result<i64, DatabaseError> {
        let version = env::var("VMVAULT_SCHEMA_VERSION")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<i64>()
            .map_err(|_| DatabaseError::Other("Invalid schema version".into()))?;

        Ok(version)
    }

    /// Gets the current schema version from the database
    async fn get_current_schema_version(pool: &Pool<MySql>) -> Result<i64, DatabaseError> {
        // Check if metadata table exists
        let metadata_exists = sqlx::query("SHOW TABLES LIKE 'metadata'")
            .fetch_optional(pool)
            .await
            .map_err(DatabaseError::SqlxError)?
            .is_some();

        if !metadata_exists {
            return Ok(0); // No schema version yet
        }

        let version = crate::db::queries::metadata::get_meta_value(pool, "vmvault_schema_version")
            .await
            .unwrap_or_else(|_| "0".to_string())
            .parse::<i64>()
            .unwrap_or(0);

        Ok(version)
    }

    /// Initializes the metadata system if it doesn't exist
    async fn initialize_metadata_system(pool: &Pool<MySql>) -> Result<(), DatabaseError> {
        info!("Initializing metadata system...");

        crate::db::queries::metadata::initialize_metadata_system(pool)
            .await
            .map_err(|e| {
                DatabaseError::MigrationError(format!(
                    "Failed to initialize metadata system: {}",
                    e
                ))
            })?;

        info!("✓ Metadata system initialized");
        Ok(())
    }

    /// Migrates the schema from one version to another
    async fn migrate_schema(
        pool: &Pool<MySql>,
        current_version: i64,
        target_version: i64,
    ) -> Result<(), DatabaseError> {
        warn!(
            "{}",
            format!(
                "Schema version mismatch! Current: {}, Target: {}",
                current_version, target_version
            )
            .yellow()
        );

        info!("Initializing protection database schema...");

        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| {
                    DatabaseError::MigrationError(format!("Failed to apply schema DDL: {}", e))
                })?;
        }

        info!("✓ Protection database schema initialized");

        // Update schema version
        crate::db::queries::metadata::set_meta_value(
            pool,
            "vmvault_schema_version",
            &target_version.to_string(),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to update schema version: {}", e))
        })?;

        info!(
            "Schema migrated from version {} to {}",
            current_version, target_version
        );

        Ok(())
    }
}
